//! Image builds
//!
//! - [`BuildOrchestrator`]: cache lookup, then launch, install, snapshot
//! - [`BuildStateStore`]: one persisted [`BuildJob`] per build
//! - [`ProgressReporter`]: install progress parsed from console markers

mod job;
mod orchestrator;
pub mod progress;
mod store;

pub use job::{BuildJob, BuildStatus};
pub use orchestrator::{
    BuildMode, BuildOptions, BuildOrchestrator, BuildRequest, EnsureOutcome, ProgressCallback,
};
pub use progress::{ProgressEvent, ProgressMarker, ProgressReporter};
pub use store::BuildStateStore;
