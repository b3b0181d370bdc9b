//! Configuration schema for envforge
//!
//! Configuration is stored at `~/.config/envforge/config.toml`

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// AWS CLI settings
    pub aws: AwsConfig,

    /// Image build settings
    pub build: BuildConfig,

    /// Managed network settings
    pub network: NetworkConfig,

    /// Retention of job records and cache index entries
    pub retention: RetentionConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,

    /// Cloud provider backend: "aws" or "memory"
    pub provider: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
            provider: "aws".to_string(),
        }
    }
}

/// AWS CLI settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// AWS profile to use
    pub profile: Option<String>,

    /// Default region when a command does not name one
    pub region: String,

    /// Owner filter for image queries ("self" or an account id)
    pub owner: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            profile: None,
            region: "us-east-1".to_string(),
            owner: "self".to_string(),
        }
    }
}

/// Image build settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Base image the ephemeral build instance boots from
    pub base_image: Option<String>,

    /// General-purpose instance size
    pub instance_type: String,

    /// Larger, build-oriented instance size used with `--large`
    pub build_instance_type: String,

    /// Subnet for the build instance (provider default when unset)
    pub subnet_id: Option<String>,

    /// Security group for the build instance (provider default when unset)
    pub security_group_id: Option<String>,

    /// Wait for the instance to reach running
    pub launch_timeout_secs: u64,

    /// Upper bound on the whole install phase
    pub install_timeout_secs: u64,

    /// Fail when no progress marker arrives for this long (0 = disabled)
    pub stall_timeout_secs: u64,

    /// Wait for the instance to reach stopped
    pub stop_timeout_secs: u64,

    /// Wait for the new image to become available
    pub image_timeout_secs: u64,

    /// Initial poll interval for provider state waits
    pub poll_interval_secs: u64,

    /// Cap for the poll backoff
    pub poll_max_interval_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            base_image: None,
            instance_type: "c5.xlarge".to_string(),
            build_instance_type: "c5.4xlarge".to_string(),
            subnet_id: None,
            security_group_id: None,
            launch_timeout_secs: 300,
            install_timeout_secs: 3600,
            stall_timeout_secs: 0,
            stop_timeout_secs: 600,
            image_timeout_secs: 1800,
            poll_interval_secs: 5,
            poll_max_interval_secs: 30,
        }
    }
}

impl BuildConfig {
    /// Stall timeout, if enabled
    pub fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout_secs > 0).then(|| Duration::from_secs(self.stall_timeout_secs))
    }
}

/// Managed network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// CIDR block of the virtual network
    pub vpc_cidr: String,

    /// CIDR block of the public subnet
    pub public_subnet_cidr: String,

    /// CIDR block of the private subnet
    pub private_subnet_cidr: String,

    /// Inbound administrative port (SSH)
    pub admin_port: u16,

    /// Source range allowed on the administrative port
    pub admin_cidr: String,

    /// Availability zone for both subnets (provider default when unset)
    pub availability_zone: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            vpc_cidr: "10.0.0.0/16".to_string(),
            public_subnet_cidr: "10.0.1.0/24".to_string(),
            private_subnet_cidr: "10.0.2.0/24".to_string(),
            admin_port: 22,
            admin_cidr: "0.0.0.0/0".to_string(),
            availability_zone: None,
        }
    }
}

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Default age for `jobs-cleanup`, in hours
    pub job_max_age_hours: u32,

    /// Default age for `images-evict`, in days
    pub cache_max_age_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            job_max_age_hours: 24,
            cache_max_age_days: 30,
        }
    }
}
