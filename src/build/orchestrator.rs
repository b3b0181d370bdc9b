//! Image build pipeline
//!
//! `ensure_image` returns a cached image when one exists and otherwise runs
//! the build on an ephemeral instance:
//!
//! | Phase      | Work                                                      |
//! |------------|-----------------------------------------------------------|
//! | Launching  | launch the instance with the wrapped install payload      |
//! | Installing | follow progress markers on the console, then stop         |
//! | Creating   | snapshot the stopped instance and wait for availability   |
//! | Complete   | image recorded in the cache                               |
//!
//! Any error marks the job Failed before it propagates. The instance is
//! terminated afterwards whatever the outcome.

use crate::audit::{events, AuditLog};
use crate::build::job::{BuildJob, BuildStatus};
use crate::build::progress::{wrap_payload, ProgressEvent, ProgressReporter};
use crate::build::store::BuildStateStore;
use crate::cache::{CacheHit, ImageCache, ImageCacheEntry};
use crate::config::schema::BuildConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::fingerprint::{tags, Fingerprint, SoftwareSpec};
use crate::provider::{ComputeProvider, ImageRequest, ImageState, InstanceRequest, InstanceState};
use crate::wait::{wait_until, WaitPolicy};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tag naming the job that launched a build instance
const JOB_ID_TAG: &str = "envforge:job-id";
/// Tag marking build instances
const ROLE_TAG: &str = "envforge:role";

/// Called with the job record every time it changes
pub type ProgressCallback = Arc<dyn Fn(&BuildJob) + Send + Sync>;

/// How long `ensure_image` blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildMode {
    /// Block until the job is terminal
    #[default]
    Synchronous,
    /// Return after launch; the rest continues on a runtime task
    Detached,
    /// Return after launch and leave the rest to a later [`BuildOrchestrator::resume`],
    /// typically in another process
    Handoff,
}

/// What to build
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub spec: SoftwareSpec,
    /// Template requesting the image
    pub template: String,
    pub region: String,
    /// Install payload run on first boot
    pub payload: String,
    /// Image name; generated from the template and fingerprint when absent
    pub target: Option<String>,
}

/// How to build it
#[derive(Clone, Default)]
pub struct BuildOptions {
    /// Skip the cache lookup
    pub force_rebuild: bool,
    /// Use the larger build instance type
    pub large_instance: bool,
    pub mode: BuildMode,
    pub cancel: CancellationToken,
    pub on_progress: Option<ProgressCallback>,
}

impl BuildOptions {
    fn notify(&self, job: &BuildJob) {
        if let Some(callback) = &self.on_progress {
            callback(job);
        }
    }
}

/// Result of [`BuildOrchestrator::ensure_image`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// An existing image matched the fingerprint
    Cached(CacheHit),
    /// A new image was built
    Built { job_id: String, image_id: String },
    /// A build was started and is still running
    Started { job_id: String },
}

impl EnsureOutcome {
    /// Image reference, if one is ready
    pub fn image_id(&self) -> Option<&str> {
        match self {
            Self::Cached(hit) => Some(&hit.image_id),
            Self::Built { image_id, .. } => Some(image_id),
            Self::Started { .. } => None,
        }
    }

    /// Job ID, if a build was started
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Cached(_) => None,
            Self::Built { job_id, .. } | Self::Started { job_id } => Some(job_id),
        }
    }
}

/// Drives image builds against a compute provider
pub struct BuildOrchestrator {
    compute: Arc<dyn ComputeProvider>,
    cache: Arc<ImageCache>,
    store: Arc<BuildStateStore>,
    audit: Arc<AuditLog>,
    config: BuildConfig,
    poll_interval: Duration,
    poll_max_interval: Duration,
    // Cancellation handles of builds running in this process
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl BuildOrchestrator {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        cache: Arc<ImageCache>,
        store: Arc<BuildStateStore>,
        audit: Arc<AuditLog>,
        config: BuildConfig,
    ) -> Self {
        let poll_interval = Duration::from_secs(config.poll_interval_secs.max(1));
        let poll_max_interval = Duration::from_secs(config.poll_max_interval_secs);
        Self {
            compute,
            cache,
            store,
            audit,
            config,
            poll_interval,
            poll_max_interval,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Override the poll backoff bounds
    pub fn with_poll_intervals(mut self, interval: Duration, max_interval: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_max_interval = max_interval;
        self
    }

    pub fn store(&self) -> &BuildStateStore {
        &self.store
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// Return an image for `request`, building one if the cache has none
    pub async fn ensure_image(
        self: &Arc<Self>,
        request: BuildRequest,
        options: BuildOptions,
    ) -> ForgeResult<EnsureOutcome> {
        // Validation happens before anything is provisioned or recorded
        let fp = Fingerprint::compute(&request.spec)?;
        let user_data = wrap_payload(&request.payload)?;

        if options.force_rebuild {
            info!("Forced rebuild of {} in {}", fp.short_hash(), request.region);
        } else if let Some(hit) = self.cache.lookup(&request.region, &fp).await? {
            info!(
                "Using cached image {} for {} ({:?})",
                hit.image_id,
                fp.short_hash(),
                hit.source
            );
            return Ok(EnsureOutcome::Cached(hit));
        }

        let job = self.launch(&request, &fp, user_data, &options).await?;
        let job_id = job.id.clone();

        match options.mode {
            BuildMode::Synchronous => {
                let image_id = self.drive(job, &options).await?;
                Ok(EnsureOutcome::Built { job_id, image_id })
            }
            BuildMode::Detached => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = this.drive(job, &options).await {
                        warn!("Detached build failed: {}", e);
                    }
                });
                Ok(EnsureOutcome::Started { job_id })
            }
            BuildMode::Handoff => Ok(EnsureOutcome::Started { job_id }),
        }
    }

    /// Continue a persisted job from its recorded phase
    pub async fn resume(&self, job_id: &str, options: &BuildOptions) -> ForgeResult<String> {
        let mut job = self.store.resolve(job_id).await?;
        match job.status {
            BuildStatus::Complete => job
                .image_id
                .ok_or_else(|| ForgeError::MissingField("image_id".to_string())),
            BuildStatus::Failed => Err(ForgeError::BuildFailed {
                job_id: job.id,
                message: job.error.unwrap_or_else(|| "unknown error".to_string()),
            }),
            _ => {
                info!("Resuming build job {} in {}", job.id, job.status);
                if job.instance_id.is_none() {
                    let err = ForgeError::MissingField("instance_id".to_string());
                    return Err(self.abort(&mut job, err, options).await);
                }
                self.drive(job, options).await
            }
        }
    }

    /// Current record of a job, by ID or unique prefix
    pub async fn status(&self, job_id: &str) -> ForgeResult<BuildJob> {
        self.store.resolve(job_id).await
    }

    /// Jobs newest first; finished jobs only when `include_finished`
    pub async fn list_jobs(&self, include_finished: bool) -> ForgeResult<Vec<BuildJob>> {
        if include_finished {
            self.store.list().await
        } else {
            self.store.list_active().await
        }
    }

    /// Cache entries, optionally for one region
    pub async fn list_cached_images(
        &self,
        region: Option<&str>,
    ) -> ForgeResult<Vec<ImageCacheEntry>> {
        self.cache.list(region).await
    }

    /// Cancel a build running in this process. Returns false if none matched.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.running().get(job_id) {
            Some(token) => {
                info!("Cancelling build job {}", job_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn policy(&self, timeout_secs: u64) -> WaitPolicy {
        WaitPolicy::with_timeout(Duration::from_secs(timeout_secs))
            .with_intervals(self.poll_interval, self.poll_max_interval)
    }

    /// Record the job and launch its instance
    async fn launch(
        &self,
        request: &BuildRequest,
        fp: &Fingerprint,
        user_data: String,
        options: &BuildOptions,
    ) -> ForgeResult<BuildJob> {
        let base_image = self
            .config
            .base_image
            .clone()
            .ok_or_else(|| ForgeError::MissingField("build.base_image".to_string()))?;
        let instance_type = if options.large_instance {
            self.config.build_instance_type.clone()
        } else {
            self.config.instance_type.clone()
        };
        let target = request
            .target
            .clone()
            .unwrap_or_else(|| default_image_name(&request.template, fp));

        let job = self
            .store
            .create(&request.template, &target, &request.region, fp.packages.len())
            .await?;
        let mut job = self
            .store
            .update(&job.id, |job| {
                job.fingerprint = Some(fp.clone());
                job.instance_type = Some(instance_type.clone());
                Ok(())
            })
            .await?;
        options.notify(&job);

        self.audit
            .log(
                events::BUILD_STARTED,
                &serde_json::json!({
                    "job_id": job.id,
                    "template": job.template,
                    "region": job.region,
                    "fingerprint": fp.hash,
                    "packages": fp.packages.len(),
                    "instance_type": instance_type,
                }),
            )
            .await;

        let mut instance_tags = BTreeMap::new();
        instance_tags.insert(JOB_ID_TAG.to_string(), job.id.clone());
        instance_tags.insert(ROLE_TAG.to_string(), "build".to_string());
        instance_tags.insert(tags::FINGERPRINT.to_string(), fp.hash.clone());

        let instance_request = InstanceRequest {
            region: request.region.clone(),
            image_id: base_image,
            instance_type,
            name: format!("envforge-build-{}", job.short_id()),
            user_data,
            subnet_id: self.config.subnet_id.clone(),
            security_group_id: self.config.security_group_id.clone(),
            tags: instance_tags,
        };

        let instance_id = match self.compute.run_instance(&instance_request).await {
            Ok(id) => id,
            Err(e) => return Err(self.abort(&mut job, e, options).await),
        };
        info!("Launched build instance {} for job {}", instance_id, job.id);

        match self
            .store
            .update(&job.id, |job| {
                job.instance_id = Some(instance_id.clone());
                job.message = format!("Waiting for instance {}", instance_id);
                Ok(())
            })
            .await
        {
            Ok(updated) => {
                options.notify(&updated);
                Ok(updated)
            }
            Err(e) => {
                job.instance_id = Some(instance_id);
                Err(self.abort(&mut job, e, options).await)
            }
        }
    }

    /// Run the remaining phases, then finalise and clean up
    async fn drive(&self, mut job: BuildJob, options: &BuildOptions) -> ForgeResult<String> {
        let cancel = options.cancel.child_token();
        self.running().insert(job.id.clone(), cancel.clone());

        let result = match self.run_phases(&mut job, options, &cancel).await {
            Ok(image_id) => self.finish(&mut job, &image_id, options).await.map(|()| image_id),
            Err(e) => Err(e),
        };
        let result = match result {
            Ok(image_id) => {
                self.cleanup(&mut job).await;
                Ok(image_id)
            }
            Err(e) => Err(self.abort(&mut job, e, options).await),
        };

        self.running().remove(&job.id);
        result
    }

    async fn run_phases(
        &self,
        job: &mut BuildJob,
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> ForgeResult<String> {
        let instance_id = job
            .instance_id
            .clone()
            .ok_or_else(|| ForgeError::MissingField("instance_id".to_string()))?;
        let region = job.region.clone();

        if job.status == BuildStatus::Launching {
            self.wait_for_instance(
                &region,
                &instance_id,
                InstanceState::Running,
                self.config.launch_timeout_secs,
                cancel,
            )
            .await?;
            self.transition(job, BuildStatus::Installing, "Installing packages", options)
                .await?;
        }

        if job.status == BuildStatus::Installing {
            self.follow_install(job, &instance_id, options, cancel).await?;

            info!("Stopping build instance {}", instance_id);
            self.compute.stop_instance(&region, &instance_id).await?;
            self.wait_for_instance(
                &region,
                &instance_id,
                InstanceState::Stopped,
                self.config.stop_timeout_secs,
                cancel,
            )
            .await?;
            self.transition(job, BuildStatus::Creating, "Creating image", options)
                .await?;
        }

        let image_id = match job.image_id.clone() {
            Some(id) => id,
            None => self.create_image(job, &instance_id, options).await?,
        };
        self.wait_for_image(&region, &image_id, cancel).await?;
        Ok(image_id)
    }

    async fn create_image(
        &self,
        job: &mut BuildJob,
        instance_id: &str,
        options: &BuildOptions,
    ) -> ForgeResult<String> {
        let fp = job
            .fingerprint
            .clone()
            .ok_or_else(|| ForgeError::MissingField("fingerprint".to_string()))?;

        let mut image_tags = fp.tags();
        image_tags.insert(tags::TEMPLATE.to_string(), job.template.clone());

        let request = ImageRequest {
            region: job.region.clone(),
            instance_id: instance_id.to_string(),
            name: job.target.clone(),
            description: format!(
                "envforge {} image, {} packages, fingerprint {}",
                job.template,
                fp.packages.len(),
                fp.short_hash()
            ),
            tags: image_tags,
        };
        let image_id = self.compute.create_image(&request).await?;
        info!("Creating image {} from {}", image_id, instance_id);

        *job = self
            .store
            .update(&job.id, |job| {
                job.image_id = Some(image_id.clone());
                job.message = format!("Waiting for image {}", image_id);
                Ok(())
            })
            .await?;
        options.notify(job);
        Ok(image_id)
    }

    async fn transition(
        &self,
        job: &mut BuildJob,
        status: BuildStatus,
        message: &str,
        options: &BuildOptions,
    ) -> ForgeResult<()> {
        *job = self.store.advance(&job.id, status, message).await?;
        options.notify(job);
        Ok(())
    }

    async fn wait_for_instance(
        &self,
        region: &str,
        instance_id: &str,
        target: InstanceState,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> ForgeResult<()> {
        let operation = format!("instance {} to be {}", instance_id, target);
        let compute = &self.compute;
        let target = &target;

        wait_until(&operation, &self.policy(timeout_secs), cancel, move || async move {
            match compute.instance_state(region, instance_id).await? {
                None => Err(ForgeError::provider(
                    "instance_state",
                    format!("instance {} no longer exists", instance_id),
                )),
                Some(state) if state == *target => Ok(Some(())),
                Some(state) if state.is_terminal() => Err(ForgeError::provider(
                    "instance_state",
                    format!("instance {} is {}", instance_id, state),
                )),
                Some(state) => {
                    debug!("Instance {} is {}", instance_id, state);
                    Ok(None)
                }
            }
        })
        .await
    }

    /// Poll the console until the payload reports DONE or FAILED
    async fn follow_install(
        &self,
        job: &mut BuildJob,
        instance_id: &str,
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> ForgeResult<()> {
        let reporter = Mutex::new(ProgressReporter::new());
        let stall_timeout = self.config.stall_timeout();
        let compute = &self.compute;
        let store = &self.store;
        let reporter_ref = &reporter;
        let region = job.region.as_str();
        let job_id = job.id.as_str();

        wait_until(
            "install payload to finish",
            &self.policy(self.config.install_timeout_secs),
            cancel,
            move || async move {
                let output = compute.console_output(region, instance_id).await?;
                let (event, quiet_for) = {
                    let mut reporter = reporter_ref.lock().unwrap_or_else(|e| e.into_inner());
                    let event = reporter.observe(&output);
                    (event, reporter.time_since_last_marker())
                };

                match event {
                    Some(ProgressEvent::Done) => Ok(Some(())),
                    Some(ProgressEvent::Failed(reason)) => Err(ForgeError::InstallFailed(reason)),
                    Some(ProgressEvent::Progress(marker)) => {
                        let updated = store
                            .update_progress(job_id, marker.percent, &marker.describe())
                            .await?;
                        options.notify(&updated);
                        Ok(None)
                    }
                    None => match stall_timeout {
                        Some(limit) if quiet_for > limit => {
                            Err(ForgeError::timeout("a progress marker", quiet_for))
                        }
                        _ => Ok(None),
                    },
                }
            },
        )
        .await?;

        *job = self.store.load(&job.id).await?;
        Ok(())
    }

    async fn wait_for_image(
        &self,
        region: &str,
        image_id: &str,
        cancel: &CancellationToken,
    ) -> ForgeResult<()> {
        let operation = format!("image {} to be available", image_id);
        let compute = &self.compute;

        wait_until(
            &operation,
            &self.policy(self.config.image_timeout_secs),
            cancel,
            move || async move {
                match compute.describe_image(region, image_id).await? {
                    Some(info) if info.state == ImageState::Available => Ok(Some(())),
                    Some(info) if !info.state.is_usable() => Err(ForgeError::provider(
                        "create_image",
                        format!("image {} entered state {:?}", image_id, info.state),
                    )),
                    // Not yet visible, or still pending
                    _ => Ok(None),
                }
            },
        )
        .await
    }

    async fn finish(
        &self,
        job: &mut BuildJob,
        image_id: &str,
        options: &BuildOptions,
    ) -> ForgeResult<()> {
        if let Some(fp) = &job.fingerprint {
            // The image carries its fingerprint tags, so a failed index write
            // only costs a provider query on the next lookup
            if let Err(e) = self.cache.record(&job.region, image_id, fp, &job.template).await {
                warn!("Failed to record {} in the image cache: {}", image_id, e);
            }
        }

        *job = self.store.mark_complete(&job.id, image_id).await?;
        options.notify(job);

        self.audit
            .log(
                events::BUILD_COMPLETED,
                &serde_json::json!({
                    "job_id": job.id,
                    "image_id": image_id,
                    "region": job.region,
                    "elapsed_secs": job.elapsed().num_seconds(),
                }),
            )
            .await;
        Ok(())
    }

    /// Mark the job Failed, clean up, and hand back the original error
    async fn abort(&self, job: &mut BuildJob, err: ForgeError, options: &BuildOptions) -> ForgeError {
        let reason = err.to_string();
        match self.store.mark_failed(&job.id, &reason).await {
            Ok(updated) => {
                *job = updated;
                options.notify(job);
            }
            Err(e) => warn!("Could not mark job {} failed: {}", job.id, e),
        }

        self.audit
            .log(
                events::BUILD_FAILED,
                &serde_json::json!({
                    "job_id": job.id,
                    "region": job.region,
                    "instance_id": job.instance_id,
                    "error": reason,
                }),
            )
            .await;

        self.cleanup(job).await;
        err
    }

    /// Terminate the build instance. Errors are recorded on the job only.
    async fn cleanup(&self, job: &mut BuildJob) {
        let Some(instance_id) = job.instance_id.clone() else {
            return;
        };

        match self.compute.terminate_instance(&job.region, &instance_id).await {
            Ok(()) => debug!("Terminated build instance {}", instance_id),
            Err(e) => {
                warn!("Failed to terminate build instance {}: {}", instance_id, e);
                let message = e.to_string();
                match self
                    .store
                    .update(&job.id, |job| {
                        job.cleanup_error = Some(message.clone());
                        Ok(())
                    })
                    .await
                {
                    Ok(updated) => *job = updated,
                    Err(e) => warn!("Could not record cleanup error on {}: {}", job.id, e),
                }
            }
        }
    }
}

/// `envforge-<template>-<os>-<toolchain>-<hash8>-<timestamp>`
fn default_image_name(template: &str, fp: &Fingerprint) -> String {
    let template: String = template
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!(
        "envforge-{}-{}-{}",
        template.trim_matches('-'),
        fp.short_tag(),
        Utc::now().format("%Y%m%d%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryCloud;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        cloud: Arc<MemoryCloud>,
        orchestrator: Arc<BuildOrchestrator>,
    }

    fn harness(configure: impl FnOnce(&mut BuildConfig)) -> Harness {
        let dir = TempDir::new().unwrap();
        let cloud = Arc::new(MemoryCloud::new());
        let cache = Arc::new(ImageCache::new(dir.path().join("image-cache.json"), cloud.clone()));
        let store = Arc::new(BuildStateStore::new(dir.path().join("jobs")));
        let mut config = BuildConfig {
            base_image: Some("ami-base".to_string()),
            ..BuildConfig::default()
        };
        configure(&mut config);

        let orchestrator = BuildOrchestrator::new(
            cloud.clone(),
            cache,
            store,
            Arc::new(AuditLog::disabled()),
            config,
        )
        .with_poll_intervals(Duration::from_millis(1), Duration::from_millis(2));

        Harness {
            _dir: dir,
            cloud,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn request() -> BuildRequest {
        BuildRequest {
            spec: SoftwareSpec::new(["gcc@11.3.0", "openmpi@4.1.4"], "rocky9", "0.21.0", "5.3.1"),
            template: "hpc".to_string(),
            region: "us-east-1".to_string(),
            payload: "spack install gcc openmpi\n".to_string(),
            target: None,
        }
    }

    fn successful_console(cloud: &MemoryCloud) {
        cloud.script_console([
            "boot",
            "[ENVFORGE-PROGRESS] Installing gcc@11.3.0 (1/2 packages, 0%)",
            "[ENVFORGE-PROGRESS] Installing openmpi@4.1.4 (2/2 packages, 50%)",
            "[ENVFORGE-PROGRESS] DONE",
        ]);
    }

    fn recording_options() -> (BuildOptions, Arc<Mutex<Vec<BuildStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = BuildOptions {
            on_progress: Some(Arc::new(move |job: &BuildJob| {
                let mut seen = sink.lock().unwrap();
                if seen.last() != Some(&job.status) {
                    seen.push(job.status);
                }
            })),
            ..BuildOptions::default()
        };
        (options, seen)
    }

    #[tokio::test]
    async fn builds_then_serves_from_cache() {
        let h = harness(|_| {});
        successful_console(&h.cloud);
        let (options, seen) = recording_options();

        let outcome = h.orchestrator.ensure_image(request(), options).await.unwrap();
        let EnsureOutcome::Built { job_id, image_id } = outcome else {
            panic!("expected a build, got {:?}", outcome);
        };

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                BuildStatus::Launching,
                BuildStatus::Installing,
                BuildStatus::Creating,
                BuildStatus::Complete
            ]
        );

        let job = h.orchestrator.status(&job_id).await.unwrap();
        assert_eq!(job.status, BuildStatus::Complete);
        assert_eq!(job.progress, 100);
        assert_eq!(job.image_id.as_deref(), Some(image_id.as_str()));
        assert_eq!(h.cloud.live_instances(), 0);

        let image = h.cloud.image(&image_id).unwrap();
        assert_eq!(image.tags.get(tags::TEMPLATE).map(String::as_str), Some("hpc"));

        let again = h
            .orchestrator
            .ensure_image(request(), BuildOptions::default())
            .await
            .unwrap();
        assert_eq!(again.image_id(), Some(image_id.as_str()));
        assert!(matches!(again, EnsureOutcome::Cached(_)));
        assert_eq!(h.cloud.call_count("run_instance"), 1);
    }

    #[tokio::test]
    async fn full_percentage_marker_completes_install() {
        let h = harness(|_| {});
        h.cloud.script_console([
            "[ENVFORGE-PROGRESS] Installing gcc@11.3.0 (1/2 packages, 0%)",
            "[ENVFORGE-PROGRESS] Installing openmpi@4.1.4 (2/2 packages, 50%)",
            "[ENVFORGE-PROGRESS] Installed (2/2 packages, 100%)",
        ]);

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let options = BuildOptions {
            on_progress: Some(Arc::new(move |job: &BuildJob| {
                sink.lock().unwrap().push((job.status, job.progress));
            })),
            ..BuildOptions::default()
        };

        let outcome = h.orchestrator.ensure_image(request(), options).await.unwrap();
        let EnsureOutcome::Built { job_id, image_id } = outcome else {
            panic!("expected a build, got {:?}", outcome);
        };

        let updates = updates.lock().unwrap().clone();
        let mut statuses: Vec<BuildStatus> = Vec::new();
        for (status, _) in &updates {
            if statuses.last() != Some(status) {
                statuses.push(*status);
            }
        }
        assert_eq!(
            statuses,
            vec![
                BuildStatus::Launching,
                BuildStatus::Installing,
                BuildStatus::Creating,
                BuildStatus::Complete
            ]
        );
        assert!(updates.contains(&(BuildStatus::Installing, 50)));

        let job = h.orchestrator.status(&job_id).await.unwrap();
        assert_eq!(job.status, BuildStatus::Complete);
        assert_eq!(job.progress, 100);
        assert_eq!(h.cloud.live_instances(), 0);

        let fingerprint = Fingerprint::compute(&request().spec).unwrap();
        let cached = h.orchestrator.list_cached_images(Some("us-east-1")).await.unwrap();
        assert!(cached
            .iter()
            .any(|entry| entry.hash == fingerprint.hash && entry.image_id == image_id));
    }

    #[tokio::test]
    async fn invalid_spec_creates_nothing() {
        let h = harness(|_| {});
        let mut req = request();
        req.spec.packages.clear();

        let err = h
            .orchestrator
            .ensure_image(req, BuildOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Validation(_)));
        assert!(h.orchestrator.list_jobs(true).await.unwrap().is_empty());
        assert!(h.cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_marker_fails_job_and_terminates_instance() {
        let h = harness(|_| {});
        h.cloud.script_console([
            "[ENVFORGE-PROGRESS] Installing gcc@11.3.0 (1/2 packages, 10%)",
            "[ENVFORGE-PROGRESS] FAILED: spack exited 1",
        ]);

        let err = h
            .orchestrator
            .ensure_image(request(), BuildOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::InstallFailed(ref r) if r == "spack exited 1"));

        let jobs = h.orchestrator.list_jobs(true).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, BuildStatus::Failed);
        assert!(jobs[0].error.as_deref().unwrap().contains("spack exited 1"));
        assert_eq!(h.cloud.live_instances(), 0);
        assert_eq!(h.cloud.call_count("create_image"), 0);
    }

    #[tokio::test]
    async fn install_timeout_fails_with_timeout() {
        let h = harness(|c| c.install_timeout_secs = 0);
        h.cloud.script_console(["no markers here"]);

        let err = h
            .orchestrator
            .ensure_image(request(), BuildOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let job = &h.orchestrator.list_jobs(true).await.unwrap()[0];
        assert_eq!(job.status, BuildStatus::Failed);
        assert_eq!(h.cloud.call_count("terminate_instance"), 1);
    }

    #[tokio::test]
    async fn cleanup_failure_keeps_primary_outcome() {
        let h = harness(|_| {});
        successful_console(&h.cloud);
        h.cloud.fail_always("terminate_instance");

        let outcome = h
            .orchestrator
            .ensure_image(request(), BuildOptions::default())
            .await
            .unwrap();
        let job = h.orchestrator.status(outcome.job_id().unwrap()).await.unwrap();
        assert_eq!(job.status, BuildStatus::Complete);
        assert!(job.cleanup_error.is_some());
    }

    #[tokio::test]
    async fn launch_failure_marks_failed() {
        let h = harness(|_| {});
        h.cloud.fail_always("run_instance");

        let err = h
            .orchestrator
            .ensure_image(request(), BuildOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Provider { .. }));

        let job = &h.orchestrator.list_jobs(true).await.unwrap()[0];
        assert_eq!(job.status, BuildStatus::Failed);
        assert!(job.instance_id.is_none());
        assert_eq!(h.cloud.call_count("terminate_instance"), 0);
    }

    #[tokio::test]
    async fn cancelled_build_still_cleans_up() {
        let h = harness(|_| {});
        h.cloud.script_console(["nothing yet"]);
        let options = BuildOptions::default();
        options.cancel.cancel();

        let err = h
            .orchestrator
            .ensure_image(request(), options)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Cancelled(_)));
        assert_eq!(h.cloud.live_instances(), 0);
        assert_eq!(
            h.orchestrator.list_jobs(true).await.unwrap()[0].status,
            BuildStatus::Failed
        );
    }

    #[tokio::test]
    async fn handoff_then_resume_completes() {
        let h = harness(|_| {});
        successful_console(&h.cloud);

        let outcome = h
            .orchestrator
            .ensure_image(
                request(),
                BuildOptions {
                    mode: BuildMode::Handoff,
                    ..BuildOptions::default()
                },
            )
            .await
            .unwrap();
        let EnsureOutcome::Started { job_id } = outcome else {
            panic!("expected a started job");
        };

        let job = h.orchestrator.status(&job_id).await.unwrap();
        assert_eq!(job.status, BuildStatus::Launching);
        assert!(job.instance_id.is_some());

        let image_id = h
            .orchestrator
            .resume(&job_id, &BuildOptions::default())
            .await
            .unwrap();
        let job = h.orchestrator.status(&job_id).await.unwrap();
        assert_eq!(job.status, BuildStatus::Complete);
        assert_eq!(job.image_id, Some(image_id.clone()));

        // Resuming a finished job just reports its image
        assert_eq!(
            h.orchestrator
                .resume(&job_id, &BuildOptions::default())
                .await
                .unwrap(),
            image_id
        );
    }

    #[tokio::test]
    async fn detached_build_finishes_in_background() {
        let h = harness(|_| {});
        successful_console(&h.cloud);

        let outcome = h
            .orchestrator
            .ensure_image(
                request(),
                BuildOptions {
                    mode: BuildMode::Detached,
                    ..BuildOptions::default()
                },
            )
            .await
            .unwrap();
        let job_id = outcome.job_id().unwrap().to_string();

        let store = h.orchestrator.store();
        let mut status = store.load(&job_id).await.unwrap().status;
        for _ in 0..500 {
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            status = store.load(&job_id).await.unwrap().status;
        }
        assert_eq!(status, BuildStatus::Complete);
    }

    #[tokio::test]
    async fn resume_fails_when_instance_is_gone() {
        let h = harness(|_| {});
        let job = h
            .orchestrator
            .store()
            .create("hpc", "t", "us-east-1", 1)
            .await
            .unwrap();
        let job = h
            .orchestrator
            .store()
            .update(&job.id, |job| {
                job.instance_id = Some("i-missing".to_string());
                Ok(())
            })
            .await
            .unwrap();

        assert!(h
            .orchestrator
            .resume(&job.id, &BuildOptions::default())
            .await
            .is_err());
        assert_eq!(
            h.orchestrator.status(&job.id).await.unwrap().status,
            BuildStatus::Failed
        );
    }

    #[test]
    fn default_name_is_sanitised() {
        let fp = Fingerprint::compute(&request().spec).unwrap();
        let name = default_image_name("My HPC/v2", &fp);
        assert!(name.starts_with("envforge-my-hpc-v2-rocky9-0.21.0-"));
    }
}
