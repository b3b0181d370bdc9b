//! Build job record

use crate::error::{ForgeError, ForgeResult};
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Build job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Launching,
    Installing,
    Creating,
    Complete,
    Failed,
}

impl BuildStatus {
    /// Complete and Failed are final
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Launching => 0,
            Self::Installing => 1,
            Self::Creating => 2,
            Self::Complete | Self::Failed => 3,
        }
    }

    /// Whether a job in this status may move to `next`.
    ///
    /// Non-terminal jobs only move forward; terminal jobs never move.
    pub fn can_advance_to(self, next: BuildStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Launching => "launching",
            Self::Installing => "installing",
            Self::Creating => "creating",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one image build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    /// Unique job ID
    pub id: String,

    /// Current status
    pub status: BuildStatus,

    /// Install progress, 0-100
    pub progress: u8,

    /// Human-readable status line
    pub message: String,

    /// Template that requested the build
    pub template: String,

    /// Name given to the resulting image
    pub target: String,

    /// Region the build runs in
    pub region: String,

    /// Number of packages being installed
    pub package_count: usize,

    /// Ephemeral build instance, once launched
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Instance type the build runs on
    #[serde(default)]
    pub instance_type: Option<String>,

    /// Resulting image, once snapshotting has started
    #[serde(default)]
    pub image_id: Option<String>,

    /// Fingerprint of the software being built
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,

    /// Failure reason
    #[serde(default)]
    pub error: Option<String>,

    /// Instance teardown error, recorded without changing the outcome
    #[serde(default)]
    pub cleanup_error: Option<String>,

    /// When the job was created
    pub started_at: DateTime<Utc>,

    /// When the job was last written
    pub updated_at: DateTime<Utc>,

    /// When the job reached a terminal status
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl BuildJob {
    /// Create a new job in `Launching` at 0%
    pub fn new(template: &str, target: &str, region: &str, package_count: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: BuildStatus::Launching,
            progress: 0,
            message: "Launching build instance".to_string(),
            template: template.to_string(),
            target: target.to_string(),
            region: region.to_string(),
            package_count,
            instance_id: None,
            instance_type: None,
            image_id: None,
            fingerprint: None,
            error: None,
            cleanup_error: None,
            started_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// Move to `next`, stamping `ended_at` on terminal statuses
    pub fn advance(&mut self, next: BuildStatus, message: impl Into<String>) -> ForgeResult<()> {
        if !self.status.can_advance_to(next) {
            return Err(ForgeError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        self.status = next;
        self.message = message.into();
        self.updated_at = now;
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        Ok(())
    }

    /// Record install progress; terminal jobs are left untouched
    pub fn set_progress(&mut self, percent: u8, message: impl Into<String>) -> ForgeResult<()> {
        if self.status.is_terminal() {
            return Err(ForgeError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: "progress update".to_string(),
            });
        }
        self.progress = percent.min(100);
        self.message = message.into();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Transition to `Complete` with the final image
    pub fn complete(&mut self, image_id: &str) -> ForgeResult<()> {
        self.advance(BuildStatus::Complete, "Image available")?;
        self.progress = 100;
        self.image_id = Some(image_id.to_string());
        Ok(())
    }

    /// Transition to `Failed` with a reason
    pub fn fail(&mut self, reason: &str) -> ForgeResult<()> {
        self.advance(BuildStatus::Failed, "Build failed")?;
        self.error = Some(reason.to_string());
        Ok(())
    }

    /// Time from start to end, or to now while running
    pub fn elapsed(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }

    /// First 8 characters of the job ID
    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }
}
