//! envforge - cached machine images and managed networks
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use envforge::cli::{commands, Cli, Commands};
use envforge::config::{Config, ConfigManager};
use envforge::error::ForgeResult;
use envforge::ui;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> ForgeResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_tracing(cli.verbose, &config);
    ui::init_theme();
    debug!("Using config {}", config_manager.path().display());

    ConfigManager::ensure_state_dirs().await?;

    match cli.command {
        Commands::Build(args) => commands::build(args, &config, cli.config.as_deref()).await,
        Commands::Resume(args) => commands::resume(args, &config).await,
        Commands::Status(args) => commands::status(args, &config).await,
        Commands::Jobs(args) => commands::jobs(args, &config).await,
        Commands::JobsCleanup(args) => commands::jobs_cleanup(args, &config).await,
        Commands::Images(args) => commands::images(args, &config).await,
        Commands::ImagesEvict(args) => commands::images_evict(args, &config).await,
        Commands::ImagesRemove(args) => commands::images_remove(args, &config).await,
        Commands::Network(args) => commands::network(args, &config).await,
        Commands::Config(args) => commands::config(args, &config, &config_manager).await,
    }
}

/// 0 = warn (spinners only), 1 = info, 2+ = debug; RUST_LOG wins when set
fn init_tracing(verbose: u8, config: &Config) {
    let level = match verbose {
        0 => "envforge=warn",
        1 => "envforge=info",
        _ => "envforge=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .without_time()
            .init();
    }
}
