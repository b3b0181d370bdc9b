//! Error types for envforge
//!
//! All modules use `ForgeResult<T>` as their return type.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for envforge operations
pub type ForgeResult<T> = Result<T, ForgeError>;

/// All errors that can occur in envforge
#[derive(Error, Debug)]
pub enum ForgeError {
    // Not-found errors
    #[error("Build job not found: {0}")]
    JobNotFound(String),

    #[error("No cached image for fingerprint {hash} in {region}")]
    CacheEntryNotFound { region: String, hash: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Build job {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Build job {job_id} failed: {message}")]
    BuildFailed { job_id: String, message: String },

    #[error("Install payload reported failure: {0}")]
    InstallFailed(String),

    // Bounded waits
    #[error("Timed out after {}s waiting for {operation}", waited.as_secs())]
    Timeout { operation: String, waited: Duration },

    #[error("Cancelled while waiting for {0}")]
    Cancelled(String),

    // Upstream provider errors
    #[error("Provider error during {operation}: {message}")]
    Provider { operation: String, message: String },

    // Input errors
    #[error("Invalid software spec: {0}")]
    Validation(String),

    // Rollback or cleanup hit errors of its own
    #[error("{cause} (rollback errors: {})", rollback_errors.join("; "))]
    PartialFailure {
        cause: Box<ForgeError>,
        rollback_errors: Vec<String>,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Required CLI not found: {name}. {hint}")]
    CliNotFound { name: String, hint: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a provider error, keeping the upstream message verbatim
    pub fn provider(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited,
        }
    }

    /// Wrap `cause` with rollback errors, or return it untouched when there are none
    pub fn with_rollback_errors(cause: ForgeError, rollback_errors: Vec<String>) -> Self {
        if rollback_errors.is_empty() {
            cause
        } else {
            Self::PartialFailure {
                cause: Box::new(cause),
                rollback_errors,
            }
        }
    }

    /// Whether this error means a job, cache entry or field was absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound(_) | Self::CacheEntryNotFound { .. } | Self::MissingField(_)
        )
    }

    /// Whether this error came from a bounded wait running out
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::PartialFailure { cause, .. } => cause.is_timeout(),
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::CliNotFound { .. } => Some("Install the AWS CLI v2 and run: aws configure"),
            Self::JobNotFound(_) => Some("Run: envforge jobs --all"),
            Self::Timeout { .. } => Some("Raise the matching *_timeout_secs value in config.toml"),
            Self::PartialFailure { .. } => {
                Some("Some resources may need manual cleanup; see the rollback errors above")
            }
            _ => None,
        }
    }
}
