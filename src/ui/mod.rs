//! UI module for consistent CLI output
//!
//! Uses `cliclack` for spinners and prompts and `indicatif` for the build
//! progress bar, with automatic fallback to plain output in CI and in
//! detached build workers.
//!
//! # Example
//!
//! ```rust,ignore
//! use envforge::ui::{self, UiContext, TaskSpinner};
//!
//! let ctx = UiContext::detect().with_auto_yes(args.yes);
//!
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Creating network 'lab'...");
//! // ... do work ...
//! spinner.stop("Network 'lab' created");
//!
//! if ui::confirm(&ctx, "Delete network 'lab'?", false).await? {
//!     // ...
//! }
//! ```

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::UiContext;
pub use output::{
    intro, key_value, outro_success, remark, step_error_detail, step_info, step_ok,
    step_ok_detail, step_warn_hint,
};
pub use progress::{plain_status_line, BuildProgress, TaskSpinner};
pub use prompts::confirm;
pub use theme::{init_theme, ForgeTheme};
