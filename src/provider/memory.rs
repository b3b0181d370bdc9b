//! In-process cloud for tests and dry runs
//!
//! Instances and images advance one lifecycle state per describe call, the
//! console replays scripted output one chunk per read, and any operation can
//! be made to fail on its n-th call. Every mutating call is recorded so tests
//! can assert exactly what was created and deleted.

use crate::error::{ForgeError, ForgeResult};
use crate::provider::{
    ComputeProvider, ImageInfo, ImageRequest, ImageState, IngressRule, InstanceRequest,
    InstanceState, NetworkProvider, SubnetRequest,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct MemoryInstance {
    region: String,
    state: InstanceState,
    console_revealed: usize,
}

#[derive(Debug, Clone)]
struct MemoryImage {
    region: String,
    info: ImageInfo,
}

/// When an injected failure fires
#[derive(Debug, Clone, Copy)]
enum Trigger {
    Nth(u32),
    Always,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    calls: Vec<String>,
    call_counts: HashMap<String, u32>,
    failures: HashMap<String, Trigger>,

    instances: HashMap<String, MemoryInstance>,
    images: HashMap<String, MemoryImage>,
    console_script: Vec<String>,

    vpcs: HashSet<String>,
    gateways: HashMap<String, Option<String>>,
    subnets: HashMap<String, bool>,
    route_tables: HashMap<String, Vec<String>>,
    security_groups: HashMap<String, Vec<IngressRule>>,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08x}", prefix, self.next_id)
    }

    /// Record a call and fire any injected failure for it
    fn enter(&mut self, operation: &str) -> ForgeResult<()> {
        self.calls.push(operation.to_string());
        let count = self.call_counts.entry(operation.to_string()).or_insert(0);
        *count += 1;

        let fire = match self.failures.get(operation) {
            Some(Trigger::Always) => true,
            Some(Trigger::Nth(n)) => *n == *count,
            None => false,
        };
        if fire {
            return Err(ForgeError::provider(
                operation,
                format!("injected failure in {}", operation),
            ));
        }
        Ok(())
    }
}

/// In-memory implementation of both provider traits
#[derive(Debug, Default)]
pub struct MemoryCloud {
    state: Mutex<MemoryState>,
}

impl MemoryCloud {
    /// Create an empty cloud
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panicking test thread must not poison the fake for the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the `nth` (1-based) call of `operation`
    pub fn fail_on(&self, operation: &str, nth: u32) {
        self.lock()
            .failures
            .insert(operation.to_string(), Trigger::Nth(nth));
    }

    /// Fail every call of `operation`
    pub fn fail_always(&self, operation: &str) {
        self.lock()
            .failures
            .insert(operation.to_string(), Trigger::Always);
    }

    /// Console output revealed one chunk per `console_output` call
    pub fn script_console<I, S>(&self, chunks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().console_script = chunks.into_iter().map(Into::into).collect();
    }

    /// Register an existing image, as if built by another process
    pub fn insert_image(&self, region: &str, image_id: &str, tags: BTreeMap<String, String>) {
        self.insert_image_at(region, image_id, tags, Utc::now());
    }

    /// Register an existing image with an explicit creation time
    pub fn insert_image_at(
        &self,
        region: &str,
        image_id: &str,
        tags: BTreeMap<String, String>,
        created_at: chrono::DateTime<Utc>,
    ) {
        self.lock().images.insert(
            image_id.to_string(),
            MemoryImage {
                region: region.to_string(),
                info: ImageInfo {
                    id: image_id.to_string(),
                    name: image_id.to_string(),
                    state: ImageState::Available,
                    created_at,
                    tags,
                },
            },
        );
    }

    /// Force an image into `state`
    pub fn set_image_state(&self, image_id: &str, state: ImageState) {
        if let Some(image) = self.lock().images.get_mut(image_id) {
            image.info.state = state;
        }
    }

    /// Remove an image out-of-band
    pub fn deregister_image(&self, image_id: &str) {
        self.lock().images.remove(image_id);
    }

    /// Every recorded call, in order
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls of `operation`
    pub fn call_count(&self, operation: &str) -> u32 {
        self.lock().call_counts.get(operation).copied().unwrap_or(0)
    }

    /// Instances that are neither terminated nor shutting down
    pub fn live_instances(&self) -> usize {
        self.lock()
            .instances
            .values()
            .filter(|i| !i.state.is_terminal())
            .count()
    }

    /// Network resources of any kind still allocated
    pub fn live_network_resources(&self) -> usize {
        let state = self.lock();
        state.vpcs.len()
            + state.gateways.len()
            + state.subnets.len()
            + state.route_tables.len()
            + state.security_groups.len()
    }

    /// Whether the subnet assigns public addresses
    pub fn subnet_is_public(&self, subnet_id: &str) -> Option<bool> {
        self.lock().subnets.get(subnet_id).copied()
    }

    /// Subnets associated with a route table
    pub fn route_table_associations(&self, route_table_id: &str) -> Vec<String> {
        self.lock()
            .route_tables
            .get(route_table_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Ingress rules of a security group
    pub fn ingress_rules(&self, group_id: &str) -> Vec<IngressRule> {
        self.lock()
            .security_groups
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Image metadata, if the image exists
    pub fn image(&self, image_id: &str) -> Option<ImageInfo> {
        self.lock().images.get(image_id).map(|i| i.info.clone())
    }
}

#[async_trait]
impl ComputeProvider for MemoryCloud {
    async fn run_instance(&self, request: &InstanceRequest) -> ForgeResult<String> {
        let mut state = self.lock();
        state.enter("run_instance")?;
        let id = state.next_id("i");
        state.instances.insert(
            id.clone(),
            MemoryInstance {
                region: request.region.clone(),
                state: InstanceState::Pending,
                console_revealed: 0,
            },
        );
        Ok(id)
    }

    async fn instance_state(
        &self,
        region: &str,
        instance_id: &str,
    ) -> ForgeResult<Option<InstanceState>> {
        let mut state = self.lock();
        state.enter("instance_state")?;
        let Some(instance) = state.instances.get_mut(instance_id) else {
            return Ok(None);
        };
        if instance.region != region {
            return Ok(None);
        }

        let current = instance.state.clone();
        instance.state = match current {
            InstanceState::Pending => InstanceState::Running,
            InstanceState::Stopping => InstanceState::Stopped,
            InstanceState::ShuttingDown => InstanceState::Terminated,
            ref other => other.clone(),
        };
        Ok(Some(current))
    }

    async fn console_output(&self, _region: &str, instance_id: &str) -> ForgeResult<String> {
        let mut state = self.lock();
        state.enter("console_output")?;
        let total = state.console_script.len();
        let revealed = {
            let instance = state.instances.get_mut(instance_id).ok_or_else(|| {
                ForgeError::provider("console_output", format!("unknown instance {}", instance_id))
            })?;
            instance.console_revealed = (instance.console_revealed + 1).min(total);
            instance.console_revealed
        };
        Ok(state.console_script[..revealed].join("\n"))
    }

    async fn stop_instance(&self, _region: &str, instance_id: &str) -> ForgeResult<()> {
        let mut state = self.lock();
        state.enter("stop_instance")?;
        let instance = state.instances.get_mut(instance_id).ok_or_else(|| {
            ForgeError::provider("stop_instance", format!("unknown instance {}", instance_id))
        })?;
        instance.state = InstanceState::Stopping;
        Ok(())
    }

    async fn terminate_instance(&self, _region: &str, instance_id: &str) -> ForgeResult<()> {
        let mut state = self.lock();
        state.enter("terminate_instance")?;
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.state = InstanceState::Terminated;
        }
        Ok(())
    }

    async fn create_image(&self, request: &ImageRequest) -> ForgeResult<String> {
        let mut state = self.lock();
        state.enter("create_image")?;
        let stopped = state
            .instances
            .get(&request.instance_id)
            .is_some_and(|i| i.state == InstanceState::Stopped);
        if !stopped {
            return Err(ForgeError::provider(
                "create_image",
                format!("instance {} is not stopped", request.instance_id),
            ));
        }

        let id = state.next_id("ami");
        state.images.insert(
            id.clone(),
            MemoryImage {
                region: request.region.clone(),
                info: ImageInfo {
                    id: id.clone(),
                    name: request.name.clone(),
                    state: ImageState::Pending,
                    created_at: Utc::now(),
                    tags: request.tags.clone(),
                },
            },
        );
        Ok(id)
    }

    async fn describe_image(&self, region: &str, image_id: &str) -> ForgeResult<Option<ImageInfo>> {
        let mut state = self.lock();
        state.enter("describe_image")?;
        let Some(image) = state.images.get_mut(image_id) else {
            return Ok(None);
        };
        if image.region != region {
            return Ok(None);
        }
        let current = image.info.clone();
        if image.info.state == ImageState::Pending {
            image.info.state = ImageState::Available;
        }
        Ok(Some(current))
    }

    async fn find_images_by_tag(
        &self,
        region: &str,
        key: &str,
        value: &str,
    ) -> ForgeResult<Vec<ImageInfo>> {
        let mut state = self.lock();
        state.enter("find_images_by_tag")?;
        Ok(state
            .images
            .values()
            .filter(|i| i.region == region && i.info.tags.get(key).map(String::as_str) == Some(value))
            .map(|i| i.info.clone())
            .collect())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl NetworkProvider for MemoryCloud {
    async fn create_vpc(&self, _region: &str, _cidr: &str, _name: &str) -> ForgeResult<String> {
        let mut state = self.lock();
        state.enter("create_vpc")?;
        let id = state.next_id("vpc");
        state.vpcs.insert(id.clone());
        Ok(id)
    }

    async fn enable_vpc_dns(&self, _region: &str, vpc_id: &str) -> ForgeResult<()> {
        let mut state = self.lock();
        state.enter("enable_vpc_dns")?;
        if !state.vpcs.contains(vpc_id) {
            return Err(ForgeError::provider("enable_vpc_dns", "unknown vpc"));
        }
        Ok(())
    }

    async fn vpc_available(&self, _region: &str, vpc_id: &str) -> ForgeResult<bool> {
        let mut state = self.lock();
        state.enter("vpc_available")?;
        Ok(state.vpcs.contains(vpc_id))
    }

    async fn delete_vpc(&self, _region: &str, vpc_id: &str) -> ForgeResult<bool> {
        let mut state = self.lock();
        state.enter("delete_vpc")?;
        Ok(state.vpcs.remove(vpc_id))
    }

    async fn create_internet_gateway(&self, _region: &str, _name: &str) -> ForgeResult<String> {
        let mut state = self.lock();
        state.enter("create_internet_gateway")?;
        let id = state.next_id("igw");
        state.gateways.insert(id.clone(), None);
        Ok(id)
    }

    async fn attach_internet_gateway(
        &self,
        _region: &str,
        gateway_id: &str,
        vpc_id: &str,
    ) -> ForgeResult<()> {
        let mut state = self.lock();
        state.enter("attach_internet_gateway")?;
        let gateway = state
            .gateways
            .get_mut(gateway_id)
            .ok_or_else(|| ForgeError::provider("attach_internet_gateway", "unknown gateway"))?;
        *gateway = Some(vpc_id.to_string());
        Ok(())
    }

    async fn detach_internet_gateway(
        &self,
        _region: &str,
        gateway_id: &str,
        _vpc_id: &str,
    ) -> ForgeResult<bool> {
        let mut state = self.lock();
        state.enter("detach_internet_gateway")?;
        match state.gateways.get_mut(gateway_id) {
            Some(attached) if attached.is_some() => {
                *attached = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_internet_gateway(&self, _region: &str, gateway_id: &str) -> ForgeResult<bool> {
        let mut state = self.lock();
        state.enter("delete_internet_gateway")?;
        Ok(state.gateways.remove(gateway_id).is_some())
    }

    async fn create_subnet(&self, _region: &str, request: &SubnetRequest) -> ForgeResult<String> {
        let mut state = self.lock();
        state.enter("create_subnet")?;
        let id = state.next_id("subnet");
        state.subnets.insert(id.clone(), request.public_addressing);
        Ok(id)
    }

    async fn delete_subnet(&self, _region: &str, subnet_id: &str) -> ForgeResult<bool> {
        let mut state = self.lock();
        state.enter("delete_subnet")?;
        Ok(state.subnets.remove(subnet_id).is_some())
    }

    async fn create_route_table(
        &self,
        _region: &str,
        _vpc_id: &str,
        _name: &str,
    ) -> ForgeResult<String> {
        let mut state = self.lock();
        state.enter("create_route_table")?;
        let id = state.next_id("rtb");
        state.route_tables.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn create_default_route(
        &self,
        _region: &str,
        route_table_id: &str,
        _gateway_id: &str,
    ) -> ForgeResult<()> {
        let mut state = self.lock();
        state.enter("create_default_route")?;
        if !state.route_tables.contains_key(route_table_id) {
            return Err(ForgeError::provider("create_default_route", "unknown route table"));
        }
        Ok(())
    }

    async fn associate_route_table(
        &self,
        _region: &str,
        route_table_id: &str,
        subnet_id: &str,
    ) -> ForgeResult<()> {
        let mut state = self.lock();
        state.enter("associate_route_table")?;
        let table = state
            .route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| ForgeError::provider("associate_route_table", "unknown route table"))?;
        table.push(subnet_id.to_string());
        Ok(())
    }

    async fn delete_route_table(&self, _region: &str, route_table_id: &str) -> ForgeResult<bool> {
        let mut state = self.lock();
        state.enter("delete_route_table")?;
        Ok(state.route_tables.remove(route_table_id).is_some())
    }

    async fn create_security_group(
        &self,
        _region: &str,
        _vpc_id: &str,
        _name: &str,
    ) -> ForgeResult<String> {
        let mut state = self.lock();
        state.enter("create_security_group")?;
        let id = state.next_id("sg");
        state.security_groups.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn authorize_ingress(
        &self,
        _region: &str,
        group_id: &str,
        rule: &IngressRule,
    ) -> ForgeResult<()> {
        let mut state = self.lock();
        state.enter("authorize_ingress")?;
        let rules = state
            .security_groups
            .get_mut(group_id)
            .ok_or_else(|| ForgeError::provider("authorize_ingress", "unknown group"))?;
        rules.push(rule.clone());
        Ok(())
    }

    async fn delete_security_group(&self, _region: &str, group_id: &str) -> ForgeResult<bool> {
        let mut state = self.lock();
        state.enter("delete_security_group")?;
        Ok(state.security_groups.remove(group_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InstanceRequest {
        InstanceRequest {
            region: "us-east-1".into(),
            image_id: "ami-base".into(),
            instance_type: "c5.xlarge".into(),
            name: "builder".into(),
            user_data: String::new(),
            subnet_id: None,
            security_group_id: None,
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn instance_advances_per_describe() {
        let cloud = MemoryCloud::new();
        let id = cloud.run_instance(&request()).await.unwrap();

        assert_eq!(
            cloud.instance_state("us-east-1", &id).await.unwrap(),
            Some(InstanceState::Pending)
        );
        assert_eq!(
            cloud.instance_state("us-east-1", &id).await.unwrap(),
            Some(InstanceState::Running)
        );
        assert_eq!(cloud.instance_state("eu-west-1", &id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn console_reveals_one_chunk_per_read() {
        let cloud = MemoryCloud::new();
        cloud.script_console(["a", "b"]);
        let id = cloud.run_instance(&request()).await.unwrap();

        assert_eq!(cloud.console_output("us-east-1", &id).await.unwrap(), "a");
        assert_eq!(cloud.console_output("us-east-1", &id).await.unwrap(), "a\nb");
        assert_eq!(cloud.console_output("us-east-1", &id).await.unwrap(), "a\nb");
    }

    #[tokio::test]
    async fn nth_call_failure() {
        let cloud = MemoryCloud::new();
        cloud.fail_on("create_subnet", 2);
        let req = SubnetRequest {
            vpc_id: "vpc-1".into(),
            cidr: "10.0.1.0/24".into(),
            availability_zone: None,
            name: "a".into(),
            public_addressing: true,
        };

        assert!(cloud.create_subnet("r", &req).await.is_ok());
        assert!(cloud.create_subnet("r", &req).await.is_err());
        assert!(cloud.create_subnet("r", &req).await.is_ok());
        assert_eq!(cloud.call_count("create_subnet"), 3);
    }
}
