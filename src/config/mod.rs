//! Configuration management for envforge

pub mod schema;

pub use schema::Config;

use crate::error::{ForgeError, ForgeResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Environment variable that relocates all persisted state
pub const STATE_DIR_ENV: &str = "ENVFORGE_STATE_DIR";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("envforge")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
            return PathBuf::from(dir);
        }
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("envforge")
    }

    /// Directory holding one JSON document per build job
    pub fn jobs_dir() -> PathBuf {
        Self::state_dir().join("jobs")
    }

    /// Image cache index document
    pub fn image_cache_path() -> PathBuf {
        Self::state_dir().join("image-cache.json")
    }

    /// Get the audit log path
    pub fn audit_log_path() -> PathBuf {
        Self::state_dir().join("audit.log")
    }

    /// Detached build worker logs
    pub fn worker_log_path(job_id: &str) -> PathBuf {
        Self::jobs_dir().join(format!("{}.log", job_id))
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> ForgeResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> ForgeResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ForgeError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| ForgeError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> ForgeResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            ForgeError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> ForgeResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ForgeError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure all state directories exist
    pub async fn ensure_state_dirs() -> ForgeResult<()> {
        for dir in [Self::state_dir(), Self::jobs_dir()] {
            fs::create_dir_all(&dir).await.map_err(|e| {
                ForgeError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
