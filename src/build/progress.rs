//! Install progress reporting
//!
//! The install payload writes marker lines to the instance console:
//!
//! ```text
//! [ENVFORGE-PROGRESS] Installing gcc@11.3.0 (3/10 packages, 30%)
//! [ENVFORGE-PROGRESS] DONE
//! [ENVFORGE-PROGRESS] FAILED: spack install exited with status 1
//! ```
//!
//! Console reads return a sliding window of recent output, so consecutive
//! windows overlap. The reporter only acts on the newest marker of each
//! window and ignores a window whose newest marker it has already seen.

use std::time::{Duration, Instant};

use crate::error::{ForgeError, ForgeResult};

/// Sentinel prefix of every progress line
pub const MARKER: &str = "[ENVFORGE-PROGRESS]";

/// Where the wrapped payload is written on the instance
const PAYLOAD_PATH: &str = "/var/lib/envforge/install-payload";

/// Heredoc delimiter used when embedding the payload
const PAYLOAD_DELIMITER: &str = "ENVFORGE_PAYLOAD_EOF";

/// One parsed progress line. Missing fields stay at zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressMarker {
    pub package: String,
    pub index: u32,
    pub total: u32,
    pub percent: u8,
}

impl ProgressMarker {
    /// Status line for the job record
    pub fn describe(&self) -> String {
        match (self.package.is_empty(), self.total) {
            (false, 0) => format!("Installing {}", self.package),
            (false, total) => format!(
                "Installing {} ({}/{} packages)",
                self.package, self.index, total
            ),
            (true, 0) => format!("Installing packages ({}%)", self.percent),
            (true, total) => format!("Installing packages ({}/{})", self.index, total),
        }
    }
}

/// Meaning of one marker line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerLine {
    Progress(ProgressMarker),
    Done,
    Failed(String),
}

/// What a console read revealed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A new progress marker
    Progress(ProgressMarker),
    /// The payload finished successfully
    Done,
    /// The payload reported failure
    Failed(String),
}

/// Parse one console line. Lines without the sentinel return `None`.
///
/// The sentinel may appear anywhere on the line, since console lines often
/// carry a kernel timestamp or cloud-init prefix.
pub fn parse_marker(line: &str) -> Option<MarkerLine> {
    let start = line.find(MARKER)?;
    let rest = line[start + MARKER.len()..].trim();

    if rest == "DONE" || rest.starts_with("DONE ") {
        return Some(MarkerLine::Done);
    }
    if let Some(reason) = rest.strip_prefix("FAILED") {
        let reason = reason.trim_start_matches(':').trim();
        let reason = if reason.is_empty() {
            "install payload failed".to_string()
        } else {
            reason.to_string()
        };
        return Some(MarkerLine::Failed(reason));
    }

    let mut marker = ProgressMarker {
        package: parse_package(rest).unwrap_or_default(),
        ..ProgressMarker::default()
    };
    if let Some((index, total)) = parse_counter(rest) {
        marker.index = index;
        marker.total = total;
    }
    if let Some(percent) = parse_percent(rest) {
        marker.percent = percent;
    }
    Some(MarkerLine::Progress(marker))
}

/// Package name following `Installing `
fn parse_package(text: &str) -> Option<String> {
    let after = &text[text.find("Installing ")? + "Installing ".len()..];
    let name = after.split_whitespace().next()?;
    let name = name.trim_end_matches([',', '.', ':']);
    (!name.is_empty()).then(|| name.to_string())
}

/// `(i/n packages` counter
fn parse_counter(text: &str) -> Option<(u32, u32)> {
    let open = text.find('(')?;
    let inner = &text[open + 1..];
    let slash = inner.find('/')?;
    let index: u32 = inner[..slash].trim().parse().ok()?;
    let after = &inner[slash + 1..];
    let digits_end = after
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(after.len());
    let total: u32 = after[..digits_end].parse().ok()?;
    after[digits_end..]
        .trim_start()
        .starts_with("package")
        .then_some((index, total))
}

/// Number directly before the last `%`, clamped to 0..=100
fn parse_percent(text: &str) -> Option<u8> {
    let pct = text.rfind('%')?;
    let head = &text[..pct];
    let start = head
        .rfind(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map_or(0, |i| i + 1);
    let value: f64 = head[start..].parse().ok()?;
    Some(value.clamp(0.0, 100.0) as u8)
}

/// Tracks install progress across console reads
#[derive(Debug)]
pub struct ProgressReporter {
    started: Instant,
    last_marker_at: Option<Instant>,
    last_line: Option<String>,
    last_count: usize,
    current: ProgressMarker,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    /// Reporter whose clock started at `started`
    pub fn started_at(started: Instant) -> Self {
        Self {
            started,
            last_marker_at: None,
            last_line: None,
            last_count: 0,
            current: ProgressMarker::default(),
        }
    }

    /// Process one console window
    pub fn observe(&mut self, output: &str) -> Option<ProgressEvent> {
        self.observe_at(output, Instant::now())
    }

    /// Process one console window read at `now`.
    ///
    /// A DONE or FAILED marker anywhere in the window wins over progress
    /// lines. Otherwise the newest marker is reported if it is new.
    pub fn observe_at(&mut self, output: &str, now: Instant) -> Option<ProgressEvent> {
        let mut newest: Option<(&str, ProgressMarker)> = None;
        let mut count = 0;

        for line in output.lines() {
            match parse_marker(line) {
                Some(MarkerLine::Done) => {
                    self.last_marker_at = Some(now);
                    self.current.percent = 100;
                    return Some(ProgressEvent::Done);
                }
                Some(MarkerLine::Failed(reason)) => {
                    self.last_marker_at = Some(now);
                    return Some(ProgressEvent::Failed(reason));
                }
                Some(MarkerLine::Progress(marker)) => {
                    count += 1;
                    newest = Some((line.trim(), marker));
                }
                None => {}
            }
        }

        let (line, marker) = newest?;
        let repeated = self.last_line.as_deref() == Some(line) && count <= self.last_count;
        self.last_count = count;
        if repeated {
            return None;
        }

        self.last_line = Some(line.to_string());
        self.last_marker_at = Some(now);
        self.current = marker.clone();

        if marker.percent >= 100 {
            return Some(ProgressEvent::Done);
        }
        Some(ProgressEvent::Progress(marker))
    }

    /// Latest marker seen
    pub fn current(&self) -> &ProgressMarker {
        &self.current
    }

    /// Latest percentage seen
    pub fn percent(&self) -> u8 {
        self.current.percent
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Estimated time remaining at the current percentage
    pub fn eta(&self) -> Duration {
        eta(self.elapsed(), self.current.percent)
    }

    /// Time since the last new marker, or since start if none arrived yet
    pub fn time_since_last_marker(&self) -> Duration {
        self.since_last_marker_at(Instant::now())
    }

    pub fn since_last_marker_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_marker_at.unwrap_or(self.started))
    }
}

/// `elapsed * (100/percent - 1)`, zero outside (0, 100)
pub fn eta(elapsed: Duration, percent: u8) -> Duration {
    if percent == 0 || percent >= 100 {
        return Duration::ZERO;
    }
    let remaining = elapsed.as_secs_f64() * (100.0 / f64::from(percent) - 1.0);
    Duration::from_secs_f64(remaining)
}

/// Fixed-width text bar, e.g. `[#####-----]  50%`
pub fn render_bar(percent: u8, width: usize) -> String {
    let percent = percent.min(100);
    let filled = width * usize::from(percent) / 100;
    format!(
        "[{}{}] {:>3}%",
        "#".repeat(filled),
        "-".repeat(width - filled),
        percent
    )
}

/// Compact duration, e.g. `42s`, `3m 05s`, `1h 02m`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Wrap a user install payload so its output reaches the console and its
/// exit status becomes a DONE or FAILED marker.
pub fn wrap_payload(payload: &str) -> ForgeResult<String> {
    if payload.trim().is_empty() {
        return Err(ForgeError::Validation("install payload is empty".to_string()));
    }
    if payload.lines().any(|line| line.trim() == PAYLOAD_DELIMITER) {
        return Err(ForgeError::Validation(format!(
            "install payload must not contain a line '{}'",
            PAYLOAD_DELIMITER
        )));
    }

    let runner = if payload.starts_with("#!") {
        PAYLOAD_PATH.to_string()
    } else {
        format!("/bin/bash {}", PAYLOAD_PATH)
    };
    let body = payload.trim_end_matches('\n');

    Ok(format!(
        r#"#!/bin/bash
exec > >(tee -a /var/log/envforge-install.log > /dev/console) 2>&1
mkdir -p /var/lib/envforge
cat > {path} <<'{delim}'
{body}
{delim}
chmod +x {path}
echo "{marker} Installing payload (0%)"
if {runner}; then
  echo "{marker} DONE"
else
  echo "{marker} FAILED: install payload exited with status $?"
fi
"#,
        path = PAYLOAD_PATH,
        delim = PAYLOAD_DELIMITER,
        body = body,
        runner = runner,
        marker = MARKER,
    ))
}
