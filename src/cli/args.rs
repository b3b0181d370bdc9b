//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// envforge - cached machine images and managed networks for compute clusters
///
/// Builds machine images with a software environment preinstalled, reuses
/// them across clusters by fingerprint, and provisions the network a
/// cluster runs in.
#[derive(Parser, Debug)]
#[command(name = "envforge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "ENVFORGE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an image for a software spec, or reuse a cached one
    Build(BuildArgs),

    /// Continue a detached build (used by `build --detach`)
    #[command(hide = true)]
    Resume(ResumeArgs),

    /// Show one build job
    Status(StatusArgs),

    /// List build jobs
    Jobs(JobsArgs),

    /// Delete finished build job records
    JobsCleanup(JobsCleanupArgs),

    /// List cached images
    Images(ImagesArgs),

    /// Drop cache entries that have not been used recently
    ImagesEvict(ImagesEvictArgs),

    /// Drop one cache entry
    ImagesRemove(ImagesRemoveArgs),

    /// Create or delete managed networks
    Network(NetworkArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Software spec file (TOML)
    pub spec: PathBuf,

    /// Install script run on the build instance
    #[arg(short, long)]
    pub payload: PathBuf,

    /// Template requesting the image (defaults to the spec name)
    #[arg(short, long)]
    pub template: Option<String>,

    /// Name for the new image
    #[arg(long)]
    pub target: Option<String>,

    /// Region to build in (default: aws.region)
    #[arg(short, long)]
    pub region: Option<String>,

    /// Rebuild even if a cached image matches
    #[arg(short, long)]
    pub force: bool,

    /// Use the larger build instance type
    #[arg(long)]
    pub large: bool,

    /// Return once the instance is launched; the build continues in the background
    #[arg(short, long)]
    pub detach: bool,
}

/// Arguments for the resume command
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Build job ID
    pub job_id: String,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Build job ID or unique prefix
    pub job: String,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the jobs command
#[derive(Parser, Debug)]
pub struct JobsArgs {
    /// Include complete and failed jobs
    #[arg(short, long)]
    pub all: bool,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the jobs-cleanup command
#[derive(Parser, Debug)]
pub struct JobsCleanupArgs {
    /// Remove finished jobs older than N hours (default: from config)
    #[arg(long)]
    pub hours: Option<u32>,

    /// Dry run - show what would be removed
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the images command
#[derive(Parser, Debug)]
pub struct ImagesArgs {
    /// Only show entries for this region
    #[arg(short, long)]
    pub region: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the images-evict command
#[derive(Parser, Debug)]
pub struct ImagesEvictArgs {
    /// Evict entries unused for N days (default: from config)
    #[arg(long)]
    pub days: Option<u32>,

    /// Dry run - show what would be evicted
    #[arg(long)]
    pub dry_run: bool,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

/// Arguments for the images-remove command
#[derive(Parser, Debug)]
pub struct ImagesRemoveArgs {
    /// Region of the entry
    pub region: String,

    /// Fingerprint hash of the entry
    pub hash: String,
}

/// Arguments for the network command
#[derive(Parser, Debug)]
pub struct NetworkArgs {
    #[command(subcommand)]
    pub action: NetworkAction,
}

/// Network subcommands
#[derive(Subcommand, Debug)]
pub enum NetworkAction {
    /// Create a managed network environment
    Create {
        /// Environment name
        name: String,

        /// Region to create it in (default: aws.region)
        #[arg(short, long)]
        region: Option<String>,

        /// Where to write the environment record (default: <name>.network.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a managed network environment
    Delete {
        /// Environment record written by `network create`
        file: PathBuf,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}
