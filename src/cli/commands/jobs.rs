//! Job commands - inspect and clean up build job records

use crate::build::{BuildJob, BuildStateStore, BuildStatus};
use crate::cli::args::{JobsArgs, JobsCleanupArgs, OutputFormat, StatusArgs};
use crate::config::Config;
use crate::error::ForgeResult;
use crate::ui::{self, UiContext};
use chrono::{Duration, Utc};
use console::{style, StyledObject};

/// Execute the jobs command
pub async fn list(args: JobsArgs, _config: &Config) -> ForgeResult<()> {
    let store = BuildStateStore::open_default();
    let jobs = if args.all {
        store.list().await?
    } else {
        store.list_active().await?
    };

    if jobs.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => {
                let ctx = UiContext::detect();
                let what = if args.all { "No build jobs" } else { "No active build jobs" };
                ui::step_info(&ctx, what);
            }
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&jobs),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Plain => {
            for job in &jobs {
                println!("{}", job.id);
            }
        }
    }

    Ok(())
}

/// Execute the status command
pub async fn status(args: StatusArgs, _config: &Config) -> ForgeResult<()> {
    let job = BuildStateStore::open_default().resolve(&args.job).await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Plain => println!("{}", job.status),
        OutputFormat::Table => print_details(&job),
    }

    Ok(())
}

/// Execute the jobs-cleanup command
pub async fn cleanup(args: JobsCleanupArgs, config: &Config) -> ForgeResult<()> {
    let ctx = UiContext::detect();
    let hours = args.hours.unwrap_or(config.retention.job_max_age_hours);
    let max_age = Duration::hours(i64::from(hours));
    let store = BuildStateStore::open_default();

    if args.dry_run {
        let cutoff = Utc::now() - max_age;
        let stale: Vec<_> = store
            .list()
            .await?
            .into_iter()
            .filter(|j| j.status.is_terminal() && j.ended_at.unwrap_or(j.updated_at) < cutoff)
            .collect();
        for job in &stale {
            println!("  would remove {} ({})", job.id, job.status);
        }
        ui::step_info(
            &ctx,
            &format!("{} job(s) finished more than {}h ago", stale.len(), hours),
        );
        return Ok(());
    }

    let removed = store.cleanup_older_than(max_age).await?;
    if removed.is_empty() {
        ui::step_info(&ctx, "Nothing to clean up");
    } else {
        ui::step_ok(&ctx, &format!("Removed {} job record(s)", removed.len()));
    }

    Ok(())
}

fn styled_status(status: BuildStatus) -> StyledObject<&'static str> {
    match status {
        BuildStatus::Complete => style("complete").green(),
        BuildStatus::Failed => style("failed").red(),
        other => style(other.as_str()).yellow(),
    }
}

fn print_table(jobs: &[BuildJob]) {
    println!(
        "{:<10} {:<12} {:>5} {:<20} {:<12} {:<17}",
        style("ID").bold(),
        style("STATUS").bold(),
        style("PCT").bold(),
        style("TEMPLATE").bold(),
        style("REGION").bold(),
        style("STARTED").bold()
    );
    println!("{}", "-".repeat(80));

    for job in jobs {
        println!(
            "{:<10} {:<12} {:>4}% {:<20} {:<12} {:<17}",
            job.short_id(),
            styled_status(job.status),
            job.progress,
            job.template,
            job.region,
            job.started_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("{} job(s)", jobs.len());
}

fn print_details(job: &BuildJob) {
    let ctx = UiContext::detect();
    ui::key_value(&ctx, "Job", &job.id);
    ui::key_value(&ctx, "Status", &styled_status(job.status).to_string());
    ui::key_value(&ctx, "Progress", &format!("{}%", job.progress));
    ui::key_value(&ctx, "Message", &job.message);
    ui::key_value(&ctx, "Template", &job.template);
    ui::key_value(&ctx, "Target", &job.target);
    ui::key_value(&ctx, "Region", &job.region);
    ui::key_value(&ctx, "Packages", &job.package_count.to_string());
    if let Some(fp) = &job.fingerprint {
        ui::key_value(&ctx, "Fingerprint", fp.short_hash());
    }
    if let Some(instance) = &job.instance_id {
        let kind = job.instance_type.as_deref().unwrap_or("-");
        ui::key_value(&ctx, "Instance", &format!("{} ({})", instance, kind));
    }
    if let Some(image) = &job.image_id {
        ui::key_value(&ctx, "Image", image);
    }
    let elapsed = job.elapsed().to_std().unwrap_or_default();
    ui::key_value(
        &ctx,
        "Elapsed",
        &crate::build::progress::format_duration(elapsed),
    );
    if let Some(error) = &job.error {
        ui::step_error_detail(&ctx, "Failed", error);
    }
    if let Some(error) = &job.cleanup_error {
        ui::step_warn_hint(&ctx, "Build instance cleanup failed", error);
    }
}
