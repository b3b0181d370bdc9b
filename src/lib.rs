//! envforge - cached machine images and managed networks for compute clusters
//!
//! Builds machine images with a declared software environment preinstalled,
//! reuses them across clusters by content fingerprint, and provisions the
//! network a cluster runs in with all-or-nothing semantics.

pub mod audit;
pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod network;
pub mod provider;
pub mod ui;
pub mod wait;

pub use error::{ForgeError, ForgeResult};
