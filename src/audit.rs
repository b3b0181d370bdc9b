//! Audit trail for resource-creating events
//!
//! Writes JSON lines to `<state dir>/audit.log`: build started, completed and
//! failed, network created, deleted and rolled back. Enabled by default.

use crate::config::{schema::Config, ConfigManager};
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Audit event names
pub mod events {
    pub const BUILD_STARTED: &str = "build.started";
    pub const BUILD_COMPLETED: &str = "build.completed";
    pub const BUILD_FAILED: &str = "build.failed";
    pub const NETWORK_CREATED: &str = "network.created";
    pub const NETWORK_DELETED: &str = "network.deleted";
    pub const NETWORK_ROLLBACK: &str = "network.rollback";
}

/// File-based audit logger that appends JSON lines
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.audit_log,
            path: ConfigManager::audit_log_path(),
        }
    }

    /// Audit logger writing to an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            path: path.into(),
        }
    }

    /// Audit logger that drops every event
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
        }
    }

    /// Log an audit event as a JSON line.
    ///
    /// IO failures are logged as warnings and otherwise ignored.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_json_line() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::at(dir.path().join("audit.log"));

        audit
            .log(
                events::BUILD_STARTED,
                &serde_json::json!({"job_id": "abc", "template": "hpc"}),
            )
            .await;

        let content = tokio::fs::read_to_string(&audit.path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();

        assert_eq!(parsed["event"], "build.started");
        assert_eq!(parsed["data"]["template"], "hpc");
        assert!(parsed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn appends_multiple_lines() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::at(dir.path().join("nested").join("audit.log"));

        audit.log(events::NETWORK_CREATED, &serde_json::json!({})).await;
        audit.log(events::NETWORK_DELETED, &serde_json::json!({})).await;

        let content = tokio::fs::read_to_string(&audit.path).await.unwrap();
        assert_eq!(content.trim().lines().count(), 2);
    }

    #[tokio::test]
    async fn skips_when_disabled() {
        let dir = TempDir::new().unwrap();
        let mut audit = AuditLog::at(dir.path().join("audit.log"));
        audit.enabled = false;

        audit.log("should.not.appear", &serde_json::json!({})).await;

        assert!(!audit.path.exists());
    }
}
