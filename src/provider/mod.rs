//! Cloud provider abstraction
//!
//! Compute (instances and images) and networking are separate traits so the
//! build pipeline and the network provisioner each depend on only what they
//! use. Two implementations exist:
//! - [`AwsCliProvider`]: shells out to the `aws` CLI
//! - [`MemoryCloud`]: in-process fake with failure injection, for tests and dry runs

mod aws;
pub mod memory;

pub use aws::AwsCliProvider;
pub use memory::MemoryCloud;

use crate::config::Config;
use crate::error::{ForgeError, ForgeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a compute instance as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Other(String),
}

impl InstanceState {
    /// Parse the provider's state name
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the instance is gone or on its way out
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::ShuttingDown => write!(f, "shutting-down"),
            Self::Terminated => write!(f, "terminated"),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Lifecycle state of an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    Pending,
    Available,
    Failed,
    Deregistered,
    Other(String),
}

impl ImageState {
    /// Parse the provider's state name
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "available" => Self::Available,
            "failed" | "error" | "invalid" => Self::Failed,
            "deregistered" => Self::Deregistered,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether an image in this state can still be launched from
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Pending | Self::Available)
    }
}

/// Request to launch an ephemeral instance
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub region: String,
    pub image_id: String,
    pub instance_type: String,
    pub name: String,
    /// First-boot content (the install payload)
    pub user_data: String,
    pub subnet_id: Option<String>,
    pub security_group_id: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// Request to snapshot a stopped instance into an image
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub region: String,
    pub instance_id: String,
    pub name: String,
    pub description: String,
    pub tags: BTreeMap<String, String>,
}

/// Image as described by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub name: String,
    pub state: ImageState,
    pub created_at: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
}

/// Request to create a subnet
#[derive(Debug, Clone)]
pub struct SubnetRequest {
    pub vpc_id: String,
    pub cidr: String,
    pub availability_zone: Option<String>,
    pub name: String,
    /// Assign public addresses to instances launched here
    pub public_addressing: bool,
}

/// Inbound security group rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressRule {
    /// One TCP port from a CIDR range
    Tcp { port: u16, cidr: String },
    /// All traffic from members of the same group
    SameGroup,
}

/// Instances and images
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Launch an instance and return its id
    async fn run_instance(&self, request: &InstanceRequest) -> ForgeResult<String>;

    /// Current instance state; `None` if the provider no longer knows it
    async fn instance_state(&self, region: &str, instance_id: &str)
        -> ForgeResult<Option<InstanceState>>;

    /// Console output captured so far (may be a trailing window)
    async fn console_output(&self, region: &str, instance_id: &str) -> ForgeResult<String>;

    /// Request a stop
    async fn stop_instance(&self, region: &str, instance_id: &str) -> ForgeResult<()>;

    /// Terminate; an instance that is already gone is not an error
    async fn terminate_instance(&self, region: &str, instance_id: &str) -> ForgeResult<()>;

    /// Snapshot an instance into a new image, returning the image id
    async fn create_image(&self, request: &ImageRequest) -> ForgeResult<String>;

    /// Describe one image; `None` if it does not exist
    async fn describe_image(&self, region: &str, image_id: &str) -> ForgeResult<Option<ImageInfo>>;

    /// Images in this region/account carrying tag `key=value`
    async fn find_images_by_tag(
        &self,
        region: &str,
        key: &str,
        value: &str,
    ) -> ForgeResult<Vec<ImageInfo>>;

    /// Human-readable provider name for display
    fn provider_name(&self) -> &'static str;
}

/// Networking resources; every delete returns `Ok(false)` when the
/// resource was already gone
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    async fn create_vpc(&self, region: &str, cidr: &str, name: &str) -> ForgeResult<String>;
    /// Enable internal DNS resolution and hostnames
    async fn enable_vpc_dns(&self, region: &str, vpc_id: &str) -> ForgeResult<()>;
    async fn vpc_available(&self, region: &str, vpc_id: &str) -> ForgeResult<bool>;
    async fn delete_vpc(&self, region: &str, vpc_id: &str) -> ForgeResult<bool>;

    async fn create_internet_gateway(&self, region: &str, name: &str) -> ForgeResult<String>;
    async fn attach_internet_gateway(&self, region: &str, gateway_id: &str, vpc_id: &str)
        -> ForgeResult<()>;
    async fn detach_internet_gateway(&self, region: &str, gateway_id: &str, vpc_id: &str)
        -> ForgeResult<bool>;
    async fn delete_internet_gateway(&self, region: &str, gateway_id: &str) -> ForgeResult<bool>;

    async fn create_subnet(&self, region: &str, request: &SubnetRequest) -> ForgeResult<String>;
    async fn delete_subnet(&self, region: &str, subnet_id: &str) -> ForgeResult<bool>;

    async fn create_route_table(&self, region: &str, vpc_id: &str, name: &str)
        -> ForgeResult<String>;
    /// Add a 0.0.0.0/0 route through the gateway
    async fn create_default_route(&self, region: &str, route_table_id: &str, gateway_id: &str)
        -> ForgeResult<()>;
    async fn associate_route_table(&self, region: &str, route_table_id: &str, subnet_id: &str)
        -> ForgeResult<()>;
    /// Disassociate every subnet, then delete
    async fn delete_route_table(&self, region: &str, route_table_id: &str) -> ForgeResult<bool>;

    async fn create_security_group(&self, region: &str, vpc_id: &str, name: &str)
        -> ForgeResult<String>;
    async fn authorize_ingress(&self, region: &str, group_id: &str, rule: &IngressRule)
        -> ForgeResult<()>;
    async fn delete_security_group(&self, region: &str, group_id: &str) -> ForgeResult<bool>;
}

/// Provider handles shared by every component of one invocation
#[derive(Clone)]
pub struct Providers {
    pub compute: Arc<dyn ComputeProvider>,
    pub network: Arc<dyn NetworkProvider>,
}

impl Providers {
    /// Use one implementation for both concerns
    pub fn from_shared<P>(provider: Arc<P>) -> Self
    where
        P: ComputeProvider + NetworkProvider + 'static,
    {
        Self {
            compute: provider.clone(),
            network: provider,
        }
    }
}

/// Create the provider selected by `general.provider`
pub fn create_providers(config: &Config) -> ForgeResult<Providers> {
    match config.general.provider.as_str() {
        "aws" => Ok(Providers::from_shared(Arc::new(AwsCliProvider::new(
            config.aws.clone(),
        )))),
        "memory" => Ok(Providers::from_shared(Arc::new(MemoryCloud::new()))),
        other => Err(ForgeError::ConfigInvalid {
            path: crate::config::ConfigManager::default_config_path(),
            reason: format!("unknown provider '{}'. Valid providers: aws, memory", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_state_parse() {
        assert_eq!(InstanceState::from_name("running"), InstanceState::Running);
        assert_eq!(
            InstanceState::from_name("shutting-down"),
            InstanceState::ShuttingDown
        );
        assert!(InstanceState::Terminated.is_terminal());
        assert!(!InstanceState::Stopped.is_terminal());
        assert_eq!(InstanceState::from_name("rebooting").to_string(), "rebooting");
    }

    #[test]
    fn image_state_usable() {
        assert!(ImageState::from_name("available").is_usable());
        assert!(ImageState::from_name("pending").is_usable());
        assert!(!ImageState::from_name("failed").is_usable());
        assert!(!ImageState::from_name("deregistered").is_usable());
    }

    #[test]
    fn unknown_provider_rejected() {
        let mut config = Config::default();
        config.general.provider = "gcp".to_string();
        assert!(matches!(
            create_providers(&config),
            Err(ForgeError::ConfigInvalid { .. })
        ));

        config.general.provider = "memory".to_string();
        let providers = create_providers(&config).unwrap();
        assert_eq!(providers.compute.provider_name(), "memory");
    }
}
