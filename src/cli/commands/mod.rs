//! CLI command implementations

pub mod build;
pub mod config;
pub mod images;
pub mod jobs;
pub mod network;

pub use build::{execute as build, resume};
pub use config::execute as config;
pub use images::{evict as images_evict, list as images, remove as images_remove};
pub use jobs::{cleanup as jobs_cleanup, list as jobs, status};
pub use network::execute as network;

use crate::audit::AuditLog;
use crate::build::{BuildOrchestrator, BuildStateStore};
use crate::cache::ImageCache;
use crate::config::{Config, ConfigManager};
use crate::error::ForgeResult;
use crate::provider::{create_providers, Providers};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Image cache backed by the configured compute provider
fn image_cache(providers: &Providers) -> Arc<ImageCache> {
    Arc::new(ImageCache::new(
        ConfigManager::image_cache_path(),
        providers.compute.clone(),
    ))
}

/// Orchestrator wired to the configured provider and the default state dir
fn orchestrator(config: &Config) -> ForgeResult<Arc<BuildOrchestrator>> {
    let providers = create_providers(config)?;
    Ok(Arc::new(BuildOrchestrator::new(
        providers.compute.clone(),
        image_cache(&providers),
        Arc::new(BuildStateStore::open_default()),
        Arc::new(AuditLog::new(config)),
        config.build.clone(),
    )))
}

/// Token cancelled on Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    token
}
