//! Build job persistence
//!
//! One JSON document per job under the jobs directory. Documents are written
//! to a temporary file and renamed into place, so a reader (or a crashed
//! writer) never leaves a half-written record behind.

use crate::build::job::{BuildJob, BuildStatus};
use crate::config::ConfigManager;
use crate::error::{ForgeError, ForgeResult};
use chrono::{Duration, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Build state store handles job CRUD and cleanup
pub struct BuildStateStore {
    dir: PathBuf,
    // Serialises load-modify-save cycles within this process
    update_lock: Mutex<()>,
}

impl BuildStateStore {
    /// Store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            update_lock: Mutex::new(()),
        }
    }

    /// Store in the default jobs directory
    pub fn open_default() -> Self {
        Self::new(ConfigManager::jobs_dir())
    }

    /// Jobs directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn job_path(&self, id: &str) -> ForgeResult<PathBuf> {
        // IDs are UUIDs; anything else cannot name a job file
        if Uuid::parse_str(id).is_err() {
            return Err(ForgeError::JobNotFound(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    /// Create and persist a new job in `Launching` at 0%
    pub async fn create(
        &self,
        template: &str,
        target: &str,
        region: &str,
        package_count: usize,
    ) -> ForgeResult<BuildJob> {
        let job = BuildJob::new(template, target, region, package_count);
        self.save(&job).await?;
        info!("Created build job {} for {}", job.id, template);
        Ok(job)
    }

    /// Persist a job, replacing any previous version
    pub async fn save(&self, job: &BuildJob) -> ForgeResult<()> {
        let path = self.job_path(&job.id)?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ForgeError::io("creating jobs directory", e))?;

        let content = serde_json::to_string_pretty(job)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| ForgeError::io(format!("writing job file {}", tmp.display()), e))?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            ForgeError::io(format!("replacing job file {}", path.display()), e)
        })?;

        debug!("Saved job {} ({}, {}%)", job.id, job.status, job.progress);
        Ok(())
    }

    /// Load a job by ID
    pub async fn load(&self, id: &str) -> ForgeResult<BuildJob> {
        let path = self.job_path(id)?;

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ForgeError::JobNotFound(id.to_string()));
            }
            Err(e) => {
                return Err(ForgeError::io(
                    format!("reading job file {}", path.display()),
                    e,
                ))
            }
        };

        Ok(serde_json::from_str(&content)?)
    }

    /// Load a job by full ID or unique ID prefix
    pub async fn resolve(&self, id_or_prefix: &str) -> ForgeResult<BuildJob> {
        if Uuid::parse_str(id_or_prefix).is_ok() {
            return self.load(id_or_prefix).await;
        }

        let mut matches: Vec<BuildJob> = self
            .list()
            .await?
            .into_iter()
            .filter(|job| !id_or_prefix.is_empty() && job.id.starts_with(id_or_prefix))
            .collect();

        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(ForgeError::JobNotFound(id_or_prefix.to_string())),
            n => Err(ForgeError::Validation(format!(
                "job prefix '{}' is ambiguous ({} matches)",
                id_or_prefix, n
            ))),
        }
    }

    /// List all readable jobs, newest first. Malformed files are skipped.
    pub async fn list(&self) -> ForgeResult<Vec<BuildJob>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }

        let mut jobs = vec![];
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| ForgeError::io("reading jobs directory", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ForgeError::io("reading job entry", e))?
        {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<BuildJob>(&content) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping malformed job file {}: {}", path.display(), e),
            }
        }

        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(jobs)
    }

    /// Jobs that have not reached a terminal status
    pub async fn list_active(&self) -> ForgeResult<Vec<BuildJob>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .collect())
    }

    /// Delete a job. Deleting a missing job is not an error.
    pub async fn delete(&self, id: &str) -> ForgeResult<()> {
        let path = self.job_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted build job {}", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ForgeError::io(
                format!("deleting job file {}", path.display()),
                e,
            )),
        }
    }

    /// Load, modify and save a job under the update lock
    pub async fn update<F>(&self, id: &str, apply: F) -> ForgeResult<BuildJob>
    where
        F: FnOnce(&mut BuildJob) -> ForgeResult<()>,
    {
        let _guard = self.update_lock.lock().await;
        let mut job = self.load(id).await?;
        apply(&mut job)?;
        self.save(&job).await?;
        Ok(job)
    }

    /// Record install progress
    pub async fn update_progress(
        &self,
        id: &str,
        percent: u8,
        message: &str,
    ) -> ForgeResult<BuildJob> {
        self.update(id, |job| job.set_progress(percent, message)).await
    }

    /// Move a job to `status`
    pub async fn advance(
        &self,
        id: &str,
        status: BuildStatus,
        message: &str,
    ) -> ForgeResult<BuildJob> {
        self.update(id, |job| job.advance(status, message)).await
    }

    /// Finish a job with its image
    pub async fn mark_complete(&self, id: &str, image_id: &str) -> ForgeResult<BuildJob> {
        let job = self.update(id, |job| job.complete(image_id)).await?;
        info!("Build job {} complete: {}", id, image_id);
        Ok(job)
    }

    /// Fail a job. A job that already reached a terminal status is not changed.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> ForgeResult<BuildJob> {
        let job = self.update(id, |job| job.fail(reason)).await?;
        warn!("Build job {} failed: {}", id, reason);
        Ok(job)
    }

    /// Remove terminal jobs that ended more than `max_age` ago.
    ///
    /// Jobs still in progress are kept regardless of age. Returns the IDs removed.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> ForgeResult<Vec<String>> {
        let cutoff = Utc::now() - max_age;
        let mut removed = vec![];

        for job in self.list().await? {
            if !job.status.is_terminal() {
                continue;
            }
            if job.ended_at.unwrap_or(job.updated_at) < cutoff {
                self.delete(&job.id).await?;
                info!("Cleaned up old build job {}", job.id);
                removed.push(job.id);
            }
        }

        Ok(removed)
    }
}
