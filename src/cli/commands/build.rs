//! Build command - ensure an image exists for a software spec

use crate::build::{
    BuildJob, BuildMode, BuildOptions, BuildOrchestrator, BuildRequest, EnsureOutcome,
    ProgressCallback,
};
use crate::cli::args::{BuildArgs, ResumeArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{ForgeError, ForgeResult};
use crate::fingerprint::{Fingerprint, SoftwareSpec};
use crate::ui::{self, BuildProgress, TaskSpinner, UiContext};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// Software spec file as written by users
#[derive(Debug, Deserialize)]
struct SpecFile {
    /// Template name, used when --template is not given
    name: Option<String>,
    #[serde(flatten)]
    spec: SoftwareSpec,
}

/// Execute the build command
pub async fn execute(
    args: BuildArgs,
    config: &Config,
    config_path: Option<&Path>,
) -> ForgeResult<()> {
    let ctx = UiContext::detect();
    let spec_file = load_spec_file(&args.spec).await?;
    let payload = fs::read_to_string(&args.payload)
        .await
        .map_err(|e| ForgeError::io(format!("reading payload {}", args.payload.display()), e))?;

    let template = args
        .template
        .or(spec_file.name)
        .unwrap_or_else(|| template_from_path(&args.spec));
    let region = args.region.unwrap_or_else(|| config.aws.region.clone());
    let fp = Fingerprint::compute(&spec_file.spec)?;

    ui::intro(&ctx, &format!("Image for {}", template));
    ui::key_value(&ctx, "Region", &region);
    ui::key_value(&ctx, "Fingerprint", fp.short_hash());
    ui::key_value(&ctx, "Packages", &spec_file.spec.packages.len().to_string());

    let orchestrator = super::orchestrator(config)?;
    let request = BuildRequest {
        spec: spec_file.spec,
        template: template.clone(),
        region,
        payload,
        target: args.target,
    };
    let options = BuildOptions {
        force_rebuild: args.force,
        large_instance: args.large,
        ..Default::default()
    };

    if args.detach {
        return start_detached(&ctx, &orchestrator, request, options, config_path).await;
    }

    let progress = Arc::new(BuildProgress::new(&ctx, &template));
    let options = BuildOptions {
        mode: BuildMode::Synchronous,
        cancel: super::cancel_on_ctrl_c(),
        on_progress: Some(progress_callback(&progress)),
        ..options
    };

    let result = orchestrator.ensure_image(request, options).await;
    progress.finish();

    match result? {
        EnsureOutcome::Cached(hit) => {
            ui::step_ok_detail(&ctx, "Using cached image", &hit.image_id);
            ui::outro_success(&ctx, &hit.image_id);
        }
        EnsureOutcome::Built { job_id, image_id } => {
            ui::key_value(&ctx, "Job", &job_id);
            ui::outro_success(&ctx, &image_id);
        }
        EnsureOutcome::Started { job_id } => {
            ui::step_info(&ctx, &format!("Build {} still running", job_id));
        }
    }

    Ok(())
}

/// Execute the hidden resume command (detached worker entry point)
pub async fn resume(args: ResumeArgs, config: &Config) -> ForgeResult<()> {
    let ctx = UiContext::non_interactive();
    let orchestrator = super::orchestrator(config)?;
    let job = orchestrator.status(&args.job_id).await?;

    let progress = Arc::new(BuildProgress::new(&ctx, &job.template));
    let options = BuildOptions {
        cancel: super::cancel_on_ctrl_c(),
        on_progress: Some(progress_callback(&progress)),
        ..Default::default()
    };

    let result = orchestrator.resume(&job.id, &options).await;
    progress.finish();
    let image_id = result?;

    ui::step_ok_detail(&ctx, "Image ready", &image_id);
    Ok(())
}

async fn start_detached(
    ctx: &UiContext,
    orchestrator: &Arc<BuildOrchestrator>,
    request: BuildRequest,
    options: BuildOptions,
    config_path: Option<&Path>,
) -> ForgeResult<()> {
    let options = BuildOptions {
        mode: BuildMode::Handoff,
        ..options
    };

    let mut spinner = TaskSpinner::new(ctx);
    spinner.start("Launching build instance...");
    let outcome = match orchestrator.ensure_image(request, options).await {
        Ok(outcome) => outcome,
        Err(e) => {
            spinner.stop_error("Launch failed");
            return Err(e);
        }
    };

    match outcome {
        EnsureOutcome::Started { job_id } => {
            spinner.stop("Build instance launched");
            let log_path = spawn_worker(&job_id, config_path)?;
            ui::key_value(ctx, "Job", &job_id);
            ui::key_value(ctx, "Worker log", &log_path.display().to_string());
            ui::remark(ctx, &format!("Run: envforge status {}", job_id));
        }
        other => {
            spinner.stop("Image ready");
            if let Some(image_id) = other.image_id() {
                ui::outro_success(ctx, image_id);
            }
        }
    }

    Ok(())
}

/// Detached `resume` invocation for `job_id`
fn worker_command(exe: &Path, job_id: &str, config_path: Option<&Path>) -> std::process::Command {
    let mut cmd = std::process::Command::new(exe);
    if let Some(path) = config_path {
        cmd.arg("--config").arg(path);
    }
    cmd.args(["-v", "resume", job_id]);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd
}

/// Re-exec as `envforge resume <job-id>` in its own process group so the
/// build outlives this process and ignores the terminal's Ctrl-C
fn spawn_worker(job_id: &str, config_path: Option<&Path>) -> ForgeResult<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| ForgeError::io("locating the envforge executable", e))?;
    let log_path = ConfigManager::worker_log_path(job_id);
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| ForgeError::io(format!("opening {}", log_path.display()), e))?;
    let log_err = log
        .try_clone()
        .map_err(|e| ForgeError::io("duplicating worker log handle", e))?;

    let mut cmd = worker_command(&exe, job_id, config_path);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    let child = cmd
        .spawn()
        .map_err(|e| ForgeError::command_failed("envforge resume", e))?;
    debug!("Started build worker pid {} for job {}", child.id(), job_id);
    Ok(log_path)
}

fn progress_callback(progress: &Arc<BuildProgress>) -> ProgressCallback {
    let progress = Arc::clone(progress);
    Arc::new(move |job: &BuildJob| progress.update(job))
}

async fn load_spec_file(path: &Path) -> ForgeResult<SpecFile> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| ForgeError::io(format!("reading spec {}", path.display()), e))?;
    parse_spec_file(&content)
}

fn parse_spec_file(content: &str) -> ForgeResult<SpecFile> {
    toml::from_str(content).map_err(|e| ForgeError::Validation(e.to_string()))
}

fn template_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("envforge")
        .to_string()
}
