//! Progress indicators with CI fallback

use super::context::UiContext;
use crate::build::progress::{eta, format_duration, render_bar};
use crate::build::{BuildJob, BuildStatus};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

/// Plain-mode output is printed every this many percent
const PLAIN_STEP: u8 = 10;

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    /// Start the spinner with a message
    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(message);
        } else if self.interactive {
            println!("{} {}", style("✓").green(), message);
        } else {
            println!("{} {}", style("[OK]").green(), message);
        }
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.error(message);
        } else if self.interactive {
            println!("{} {}", style("✗").red(), message);
        } else {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }
}

/// Progress display for an image build.
///
/// Fed with the job record on every change. Draws an indicatif bar in
/// interactive mode; in CI prints a line on each phase change and every
/// [`PLAIN_STEP`] percent.
pub struct BuildProgress {
    bar: Option<ProgressBar>,
    // (status, percent) last printed in plain mode
    last_plain: Mutex<Option<(BuildStatus, u8)>>,
}

impl BuildProgress {
    pub fn new(ctx: &UiContext, label: &str) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new(100);
            let style = ProgressStyle::with_template(
                "  {spinner:.cyan} {prefix:<10} {bar:24.cyan/dim} {pos:>3}% {msg:.dim}  {elapsed:.dim}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
            .progress_chars("━╸─");
            bar.set_style(style);
            bar.set_prefix(BuildStatus::Launching.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        } else {
            println!("Building {}...", label);
            None
        };
        Self {
            bar,
            last_plain: Mutex::new(None),
        }
    }

    /// Render the latest job state
    pub fn update(&self, job: &BuildJob) {
        if let Some(bar) = &self.bar {
            bar.set_prefix(job.status.to_string());
            bar.set_position(u64::from(job.progress));
            bar.set_message(job.message.clone());
            return;
        }

        if let Some(line) = self.plain_line(job) {
            println!("{}", line);
        }
    }

    /// Finish and clear the bar
    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }

    fn plain_line(&self, job: &BuildJob) -> Option<String> {
        let mut last = self.last_plain.lock().ok()?;
        let due = match *last {
            None => true,
            Some((status, percent)) => {
                status != job.status || job.progress >= percent.saturating_add(PLAIN_STEP)
            }
        };
        if !due {
            return None;
        }
        *last = Some((job.status, job.progress));
        Some(plain_status_line(job))
    }
}

/// One-line rendering of a job for logs and CI output
pub fn plain_status_line(job: &BuildJob) -> String {
    let elapsed = job.elapsed().to_std().unwrap_or_default();
    let mut line = format!(
        "  {:<10} {} {}",
        job.status.as_str(),
        render_bar(job.progress, 20),
        job.message
    );
    if job.status == BuildStatus::Installing && job.progress > 0 && job.progress < 100 {
        line.push_str(&format!(
            " ({} elapsed, ~{} left)",
            format_duration(elapsed),
            format_duration(eta(elapsed, job.progress))
        ));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_at(status: BuildStatus, progress: u8) -> BuildJob {
        let mut job = BuildJob::new("base", "base-image", "us-east-1", 3);
        job.status = status;
        job.progress = progress;
        job.message = "installing".to_string();
        job
    }

    #[test]
    fn spinner_non_interactive() {
        let ctx = UiContext::non_interactive();
        let mut spinner = TaskSpinner::new(&ctx);
        spinner.start("Testing...");
        spinner.stop("Done");
    }

    #[test]
    fn plain_prints_on_phase_change_and_steps() {
        let progress = BuildProgress::new(&UiContext::non_interactive(), "base");

        assert!(progress.plain_line(&job_at(BuildStatus::Launching, 0)).is_some());
        assert!(progress.plain_line(&job_at(BuildStatus::Launching, 0)).is_none());
        assert!(progress.plain_line(&job_at(BuildStatus::Installing, 0)).is_some());
        assert!(progress.plain_line(&job_at(BuildStatus::Installing, 5)).is_none());
        assert!(progress.plain_line(&job_at(BuildStatus::Installing, 10)).is_some());
        assert!(progress.plain_line(&job_at(BuildStatus::Installing, 19)).is_none());
        assert!(progress.plain_line(&job_at(BuildStatus::Creating, 100)).is_some());
    }

    #[test]
    fn status_line_includes_bar_and_message() {
        let line = plain_status_line(&job_at(BuildStatus::Creating, 100));
        assert!(line.contains("creating"));
        assert!(line.contains("100%"));
        assert!(line.contains("installing"));
    }
}
