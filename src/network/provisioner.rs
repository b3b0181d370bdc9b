//! Network creation with rollback, and teardown
//!
//! Every resource is pushed onto an undo stack the moment it exists. If a
//! later step fails the stack is unwound in reverse, attempting every
//! delete even when an earlier one fails, so a failed create never leaves
//! a partial environment behind.

use crate::audit::{events, AuditLog};
use crate::config::schema::NetworkConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::network::environment::{parse_cidr, validate_name, NetworkEnvironment};
use crate::provider::{IngressRule, NetworkProvider, SubnetRequest};
use crate::wait::{wait_until, WaitPolicy};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A resource created by this provisioner
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resource {
    Vpc(String),
    Gateway { id: String, vpc_id: String },
    Subnet(String),
    RouteTable(String),
    SecurityGroup(String),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vpc(id) => write!(f, "vpc {}", id),
            Self::Gateway { id, .. } => write!(f, "internet gateway {}", id),
            Self::Subnet(id) => write!(f, "subnet {}", id),
            Self::RouteTable(id) => write!(f, "route table {}", id),
            Self::SecurityGroup(id) => write!(f, "security group {}", id),
        }
    }
}

/// Creates and deletes managed network environments in one region
pub struct NetworkProvisioner {
    network: Arc<dyn NetworkProvider>,
    region: String,
    config: NetworkConfig,
    audit: Arc<AuditLog>,
    wait_policy: WaitPolicy,
    cancel: CancellationToken,
}

impl NetworkProvisioner {
    pub fn new(
        network: Arc<dyn NetworkProvider>,
        region: impl Into<String>,
        config: NetworkConfig,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            network,
            region: region.into(),
            config,
            audit,
            wait_policy: WaitPolicy::with_timeout(Duration::from_secs(300))
                .with_intervals(Duration::from_secs(2), Duration::from_secs(15)),
            cancel: CancellationToken::new(),
        }
    }

    /// Override how long to wait for the VPC to become available
    pub fn with_wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.wait_policy = policy;
        self
    }

    /// Abort pending waits when `token` is cancelled
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn validate(&self, name: &str) -> ForgeResult<()> {
        validate_name(name)?;
        let vpc = parse_cidr(&self.config.vpc_cidr, "network.vpc_cidr")?;
        for (field, value) in [
            ("network.public_subnet_cidr", &self.config.public_subnet_cidr),
            ("network.private_subnet_cidr", &self.config.private_subnet_cidr),
        ] {
            let subnet = parse_cidr(value, field)?;
            if !vpc.contains(&subnet) {
                return Err(ForgeError::Validation(format!(
                    "{} {} is outside network.vpc_cidr {}",
                    field, value, self.config.vpc_cidr
                )));
            }
        }
        parse_cidr(&self.config.admin_cidr, "network.admin_cidr")?;
        if self.config.admin_port == 0 {
            return Err(ForgeError::Validation(
                "network.admin_port must be 1-65535".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a complete environment, or nothing at all
    pub async fn create_network(&self, name: &str) -> ForgeResult<NetworkEnvironment> {
        self.validate(name)?;
        info!("Creating network environment '{}' in {}", name, self.region);

        let mut created = Vec::new();
        match self.provision(name, &mut created).await {
            Ok(env) => {
                self.audit
                    .log(events::NETWORK_CREATED, &serde_json::to_value(&env).unwrap_or_default())
                    .await;
                info!("Network environment '{}' ready: {}", name, env.vpc_id);
                Ok(env)
            }
            Err(cause) => {
                warn!(
                    "Creating network '{}' failed after {} resource(s): {}",
                    name,
                    created.len(),
                    cause
                );
                let rollback_errors = self.teardown(&created).await;

                self.audit
                    .log(
                        events::NETWORK_ROLLBACK,
                        &serde_json::json!({
                            "name": name,
                            "region": self.region,
                            "error": cause.to_string(),
                            "resources": created.iter().map(ToString::to_string).collect::<Vec<_>>(),
                            "rollback_errors": rollback_errors,
                        }),
                    )
                    .await;

                Err(ForgeError::with_rollback_errors(cause, rollback_errors))
            }
        }
    }

    async fn provision(
        &self,
        name: &str,
        created: &mut Vec<Resource>,
    ) -> ForgeResult<NetworkEnvironment> {
        let net = &self.network;
        let region = self.region.as_str();

        // 1. Virtual network with internal DNS
        let vpc_id = net
            .create_vpc(region, &self.config.vpc_cidr, &format!("{}-vpc", name))
            .await?;
        created.push(Resource::Vpc(vpc_id.clone()));
        self.wait_for_vpc(&vpc_id).await?;
        net.enable_vpc_dns(region, &vpc_id).await?;
        debug!("Step 1/6: vpc {}", vpc_id);

        // 2. Internet gateway, attached
        let gateway_id = net
            .create_internet_gateway(region, &format!("{}-igw", name))
            .await?;
        created.push(Resource::Gateway {
            id: gateway_id.clone(),
            vpc_id: vpc_id.clone(),
        });
        net.attach_internet_gateway(region, &gateway_id, &vpc_id)
            .await?;
        debug!("Step 2/6: gateway {}", gateway_id);

        // 3. Public subnet
        let public_subnet_id = net
            .create_subnet(
                region,
                &SubnetRequest {
                    vpc_id: vpc_id.clone(),
                    cidr: self.config.public_subnet_cidr.clone(),
                    availability_zone: self.config.availability_zone.clone(),
                    name: format!("{}-public", name),
                    public_addressing: true,
                },
            )
            .await?;
        created.push(Resource::Subnet(public_subnet_id.clone()));
        debug!("Step 3/6: public subnet {}", public_subnet_id);

        // 4. Private subnet
        let private_subnet_id = net
            .create_subnet(
                region,
                &SubnetRequest {
                    vpc_id: vpc_id.clone(),
                    cidr: self.config.private_subnet_cidr.clone(),
                    availability_zone: self.config.availability_zone.clone(),
                    name: format!("{}-private", name),
                    public_addressing: false,
                },
            )
            .await?;
        created.push(Resource::Subnet(private_subnet_id.clone()));
        debug!("Step 4/6: private subnet {}", private_subnet_id);

        // 5. Route table: default route via the gateway, public subnet only
        let route_table_id = net
            .create_route_table(region, &vpc_id, &format!("{}-rt", name))
            .await?;
        created.push(Resource::RouteTable(route_table_id.clone()));
        net.create_default_route(region, &route_table_id, &gateway_id)
            .await?;
        net.associate_route_table(region, &route_table_id, &public_subnet_id)
            .await?;
        debug!("Step 5/6: route table {}", route_table_id);

        // 6. Security group: admin port plus intra-group traffic
        let security_group_id = net
            .create_security_group(region, &vpc_id, &format!("{}-sg", name))
            .await?;
        created.push(Resource::SecurityGroup(security_group_id.clone()));
        net.authorize_ingress(
            region,
            &security_group_id,
            &IngressRule::Tcp {
                port: self.config.admin_port,
                cidr: self.config.admin_cidr.clone(),
            },
        )
        .await?;
        net.authorize_ingress(region, &security_group_id, &IngressRule::SameGroup)
            .await?;
        debug!("Step 6/6: security group {}", security_group_id);

        Ok(NetworkEnvironment {
            name: name.to_string(),
            region: self.region.clone(),
            vpc_id,
            gateway_id,
            public_subnet_id,
            private_subnet_id,
            route_table_id,
            security_group_id,
            managed: true,
            created_at: Utc::now(),
        })
    }

    async fn wait_for_vpc(&self, vpc_id: &str) -> ForgeResult<()> {
        let net = &self.network;
        let region = self.region.as_str();
        wait_until(
            &format!("vpc {} to be available", vpc_id),
            &self.wait_policy,
            &self.cancel,
            move || async move {
                Ok::<_, ForgeError>(net.vpc_available(region, vpc_id).await?.then_some(()))
            },
        )
        .await
    }

    /// Delete a managed environment. Unmanaged environments are left alone.
    ///
    /// Resources that are already gone count as deleted, so this is safe to
    /// repeat after a partial failure.
    pub async fn delete_network(&self, env: &NetworkEnvironment) -> ForgeResult<()> {
        if !env.managed {
            info!(
                "Network '{}' is not managed by envforge; leaving it in place",
                env.name
            );
            return Ok(());
        }

        info!("Deleting network environment '{}' ({})", env.name, env.vpc_id);
        let resources = vec![
            Resource::Vpc(env.vpc_id.clone()),
            Resource::Gateway {
                id: env.gateway_id.clone(),
                vpc_id: env.vpc_id.clone(),
            },
            Resource::Subnet(env.public_subnet_id.clone()),
            Resource::Subnet(env.private_subnet_id.clone()),
            Resource::RouteTable(env.route_table_id.clone()),
            Resource::SecurityGroup(env.security_group_id.clone()),
        ];
        let errors = self.teardown_in(&env.region, &resources).await;

        self.audit
            .log(
                events::NETWORK_DELETED,
                &serde_json::json!({
                    "name": env.name,
                    "region": env.region,
                    "vpc_id": env.vpc_id,
                    "errors": errors,
                }),
            )
            .await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ForgeError::with_rollback_errors(
                ForgeError::provider(
                    "delete_network",
                    format!("{} resource(s) of '{}' could not be deleted", errors.len(), env.name),
                ),
                errors,
            ))
        }
    }

    async fn teardown(&self, created: &[Resource]) -> Vec<String> {
        self.teardown_in(&self.region, created).await
    }

    /// Delete `resources` newest first, collecting every error
    async fn teardown_in(&self, region: &str, resources: &[Resource]) -> Vec<String> {
        let mut errors = Vec::new();
        for resource in resources.iter().rev() {
            match self.delete(region, resource).await {
                Ok(true) => debug!("Deleted {}", resource),
                Ok(false) => debug!("{} was already gone", resource),
                Err(e) => {
                    warn!("Failed to delete {}: {}", resource, e);
                    errors.push(format!("delete {}: {}", resource, e));
                }
            }
        }
        errors
    }

    async fn delete(&self, region: &str, resource: &Resource) -> ForgeResult<bool> {
        let net = &self.network;
        match resource {
            Resource::Vpc(id) => net.delete_vpc(region, id).await,
            Resource::Gateway { id, vpc_id } => {
                net.detach_internet_gateway(region, id, vpc_id).await?;
                net.delete_internet_gateway(region, id).await
            }
            Resource::Subnet(id) => net.delete_subnet(region, id).await,
            Resource::RouteTable(id) => net.delete_route_table(region, id).await,
            Resource::SecurityGroup(id) => net.delete_security_group(region, id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryCloud;

    fn provisioner(cloud: &Arc<MemoryCloud>) -> NetworkProvisioner {
        NetworkProvisioner::new(
            cloud.clone(),
            "us-east-1",
            NetworkConfig::default(),
            Arc::new(AuditLog::disabled()),
        )
        .with_wait_policy(
            WaitPolicy::with_timeout(Duration::from_secs(5))
                .with_intervals(Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    #[tokio::test]
    async fn creates_full_environment() {
        let cloud = Arc::new(MemoryCloud::new());
        let env = provisioner(&cloud).create_network("hpc").await.unwrap();

        assert!(env.managed);
        assert_eq!(cloud.live_network_resources(), 6);
        assert_eq!(cloud.subnet_is_public(&env.public_subnet_id), Some(true));
        assert_eq!(cloud.subnet_is_public(&env.private_subnet_id), Some(false));
        assert_eq!(
            cloud.route_table_associations(&env.route_table_id),
            vec![env.public_subnet_id.clone()]
        );

        let rules = cloud.ingress_rules(&env.security_group_id);
        assert!(rules.contains(&IngressRule::SameGroup));
        assert!(rules.contains(&IngressRule::Tcp {
            port: 22,
            cidr: "0.0.0.0/0".to_string()
        }));
    }

    #[tokio::test]
    async fn failure_at_every_step_leaves_nothing() {
        let failing = [
            "enable_vpc_dns",
            "attach_internet_gateway",
            "create_subnet",
            "create_route_table",
            "associate_route_table",
            "create_security_group",
            "authorize_ingress",
        ];
        for op in failing {
            let cloud = Arc::new(MemoryCloud::new());
            cloud.fail_on(op, 1);

            let err = provisioner(&cloud).create_network("hpc").await.unwrap_err();
            assert!(
                matches!(err, ForgeError::Provider { ref operation, .. } if operation == op),
                "{}: {:?}",
                op,
                err
            );
            assert_eq!(cloud.live_network_resources(), 0, "leak after {} failed", op);
        }
    }

    #[tokio::test]
    async fn rollback_is_reverse_order_and_exhaustive() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.fail_on("create_security_group", 1);
        cloud.fail_always("delete_route_table");

        let err = provisioner(&cloud).create_network("hpc").await.unwrap_err();
        let ForgeError::PartialFailure {
            cause,
            rollback_errors,
        } = err
        else {
            panic!("expected partial failure");
        };
        assert!(matches!(*cause, ForgeError::Provider { .. }));
        assert_eq!(rollback_errors.len(), 1);
        assert!(rollback_errors[0].contains("route table"));

        let deletes: Vec<String> = cloud
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("delete_") || c.starts_with("detach_"))
            .collect();
        assert_eq!(
            deletes,
            vec![
                "delete_route_table",
                "delete_subnet",
                "delete_subnet",
                "detach_internet_gateway",
                "delete_internet_gateway",
                "delete_vpc",
            ]
        );
        // Only the route table survives
        assert_eq!(cloud.live_network_resources(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let cloud = Arc::new(MemoryCloud::new());
        let provisioner = provisioner(&cloud);
        let env = provisioner.create_network("hpc").await.unwrap();

        provisioner.delete_network(&env).await.unwrap();
        assert_eq!(cloud.live_network_resources(), 0);
        provisioner.delete_network(&env).await.unwrap();
    }

    #[tokio::test]
    async fn unmanaged_environment_is_never_deleted() {
        let cloud = Arc::new(MemoryCloud::new());
        let provisioner = provisioner(&cloud);
        let mut env = provisioner.create_network("hpc").await.unwrap();
        env.managed = false;
        let before = cloud.calls().len();

        provisioner.delete_network(&env).await.unwrap();
        assert_eq!(cloud.calls().len(), before);
        assert_eq!(cloud.live_network_resources(), 6);
    }

    #[tokio::test]
    async fn invalid_config_creates_nothing() {
        let cloud = Arc::new(MemoryCloud::new());
        let config = NetworkConfig {
            public_subnet_cidr: "192.168.0.0/24".to_string(),
            ..NetworkConfig::default()
        };
        let provisioner = NetworkProvisioner::new(
            cloud.clone(),
            "us-east-1",
            config,
            Arc::new(AuditLog::disabled()),
        );

        let err = provisioner.create_network("hpc").await.unwrap_err();
        assert!(matches!(err, ForgeError::Validation(_)));
        assert!(cloud.calls().is_empty());
    }
}
