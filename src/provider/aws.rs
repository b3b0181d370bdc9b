//! AWS provider backed by the `aws` CLI
//!
//! Every call runs `aws ec2 <op> ... --output json` and parses stdout.
//! Non-zero exits become provider errors carrying stderr verbatim; the
//! EC2 `*.NotFound` codes map to "absent" where the trait allows it.

use crate::config::schema::AwsConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::provider::{
    ComputeProvider, ImageInfo, ImageRequest, ImageState, IngressRule, InstanceRequest,
    InstanceState, NetworkProvider, SubnetRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Error code fragments EC2 uses for resources that do not exist
const NOT_FOUND_CODES: &[&str] = &[
    ".NotFound",
    ".Malformed",
    "Gateway.NotAttached",
    "InvalidAMIID.Unavailable",
];

/// Failure of one CLI invocation
enum CliFailure {
    /// The resource does not exist
    NotFound(String),
    Other(ForgeError),
}

impl From<CliFailure> for ForgeError {
    fn from(failure: CliFailure) -> Self {
        match failure {
            CliFailure::NotFound(message) => ForgeError::provider("lookup", message),
            CliFailure::Other(err) => err,
        }
    }
}

/// AWS provider using the AWS CLI
pub struct AwsCliProvider {
    config: AwsConfig,
}

impl AwsCliProvider {
    /// Create a provider for the given AWS settings
    pub fn new(config: AwsConfig) -> Self {
        Self { config }
    }

    /// Run `aws ec2 <operation> <args>` and parse the JSON response
    async fn ec2(&self, region: &str, operation: &str, args: &[String]) -> Result<Value, CliFailure> {
        let mut cmd = Command::new("aws");
        cmd.arg("ec2").arg(operation).args(args);
        cmd.args(["--region", region, "--output", "json"]);

        if let Some(profile) = &self.config.profile {
            cmd.args(["--profile", profile]);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("aws ec2 {} ({})", operation, region);

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CliFailure::Other(ForgeError::CliNotFound {
                    name: "aws".to_string(),
                    hint: "Install it from https://aws.amazon.com/cli/".to_string(),
                })
            } else {
                CliFailure::Other(ForgeError::command_failed(
                    format!("aws ec2 {}", operation),
                    e,
                ))
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if NOT_FOUND_CODES.iter().any(|code| stderr.contains(code)) {
                return Err(CliFailure::NotFound(stderr));
            }
            return Err(CliFailure::Other(ForgeError::provider(operation, stderr)));
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            CliFailure::Other(ForgeError::provider(
                operation,
                format!("unparseable response: {}", e),
            ))
        })
    }

    /// Run an operation where "not found" is a hard error
    async fn call(&self, region: &str, operation: &str, args: Vec<String>) -> ForgeResult<Value> {
        self.ec2(region, operation, &args).await.map_err(|failure| match failure {
            CliFailure::NotFound(message) => ForgeError::provider(operation, message),
            CliFailure::Other(err) => err,
        })
    }

    /// Run a delete-style operation; `Ok(false)` when already gone
    async fn delete(&self, region: &str, operation: &str, args: Vec<String>) -> ForgeResult<bool> {
        match self.ec2(region, operation, &args).await {
            Ok(_) => Ok(true),
            Err(CliFailure::NotFound(message)) => {
                debug!("{}: already gone ({})", operation, message);
                Ok(false)
            }
            Err(failure) => Err(failure.into()),
        }
    }
}

fn string_field(value: &Value, pointer: &str, operation: &str) -> ForgeResult<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ForgeError::provider(operation, format!("response is missing {}", pointer))
        })
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// `--tag-specifications` JSON for one resource type
fn tag_spec(resource_type: &str, tags: &BTreeMap<String, String>) -> String {
    let tags: Vec<Value> = tags
        .iter()
        .map(|(k, v)| json!({ "Key": k, "Value": v }))
        .collect();
    json!([{ "ResourceType": resource_type, "Tags": tags }]).to_string()
}

fn name_tag(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("Name".to_string(), name.to_string())])
}

fn parse_tags(value: &Value) -> BTreeMap<String, String> {
    value
        .get("Tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(|t| {
                    Some((
                        t.get("Key")?.as_str()?.to_string(),
                        t.get("Value")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_image(value: &Value) -> Option<ImageInfo> {
    let created_at = value
        .get("CreationDate")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    Some(ImageInfo {
        id: value.get("ImageId")?.as_str()?.to_string(),
        name: value
            .get("Name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        state: ImageState::from_name(value.get("State").and_then(Value::as_str).unwrap_or("")),
        created_at,
        tags: parse_tags(value),
    })
}

#[async_trait]
impl ComputeProvider for AwsCliProvider {
    async fn run_instance(&self, request: &InstanceRequest) -> ForgeResult<String> {
        let mut tags = request.tags.clone();
        tags.insert("Name".to_string(), request.name.clone());

        let mut cmd_args = args([
            "--image-id",
            &request.image_id,
            "--instance-type",
            &request.instance_type,
            "--count",
            "1",
            "--user-data",
            &request.user_data,
            "--instance-initiated-shutdown-behavior",
            "stop",
        ]);
        cmd_args.push("--tag-specifications".to_string());
        cmd_args.push(tag_spec("instance", &tags));
        if let Some(subnet) = &request.subnet_id {
            cmd_args.extend(args(["--subnet-id", subnet]));
        }
        if let Some(group) = &request.security_group_id {
            cmd_args.extend(args(["--security-group-ids", group]));
        }

        let response = self.call(&request.region, "run-instances", cmd_args).await?;
        string_field(&response, "/Instances/0/InstanceId", "run-instances")
    }

    async fn instance_state(
        &self,
        region: &str,
        instance_id: &str,
    ) -> ForgeResult<Option<InstanceState>> {
        let response = match self
            .ec2(region, "describe-instances", &args(["--instance-ids", instance_id]))
            .await
        {
            Ok(v) => v,
            Err(CliFailure::NotFound(_)) => return Ok(None),
            Err(failure) => return Err(failure.into()),
        };

        Ok(response
            .pointer("/Reservations/0/Instances/0/State/Name")
            .and_then(Value::as_str)
            .map(InstanceState::from_name))
    }

    async fn console_output(&self, region: &str, instance_id: &str) -> ForgeResult<String> {
        let response = self
            .call(
                region,
                "get-console-output",
                args(["--instance-id", instance_id, "--latest"]),
            )
            .await?;

        Ok(response
            .get("Output")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn stop_instance(&self, region: &str, instance_id: &str) -> ForgeResult<()> {
        self.call(region, "stop-instances", args(["--instance-ids", instance_id]))
            .await?;
        Ok(())
    }

    async fn terminate_instance(&self, region: &str, instance_id: &str) -> ForgeResult<()> {
        self.delete(
            region,
            "terminate-instances",
            args(["--instance-ids", instance_id]),
        )
        .await?;
        Ok(())
    }

    async fn create_image(&self, request: &ImageRequest) -> ForgeResult<String> {
        let mut cmd_args = args([
            "--instance-id",
            &request.instance_id,
            "--name",
            &request.name,
            "--description",
            &request.description,
        ]);
        cmd_args.push("--tag-specifications".to_string());
        cmd_args.push(tag_spec("image", &request.tags));

        let response = self.call(&request.region, "create-image", cmd_args).await?;
        string_field(&response, "/ImageId", "create-image")
    }

    async fn describe_image(&self, region: &str, image_id: &str) -> ForgeResult<Option<ImageInfo>> {
        let response = match self
            .ec2(region, "describe-images", &args(["--image-ids", image_id]))
            .await
        {
            Ok(v) => v,
            Err(CliFailure::NotFound(_)) => return Ok(None),
            Err(failure) => return Err(failure.into()),
        };

        Ok(response.pointer("/Images/0").and_then(parse_image))
    }

    async fn find_images_by_tag(
        &self,
        region: &str,
        key: &str,
        value: &str,
    ) -> ForgeResult<Vec<ImageInfo>> {
        let filter = format!("Name=tag:{},Values={}", key, value);
        let response = self
            .call(
                region,
                "describe-images",
                args(["--owners", &self.config.owner, "--filters", &filter]),
            )
            .await?;

        Ok(response
            .get("Images")
            .and_then(Value::as_array)
            .map(|images| images.iter().filter_map(parse_image).collect())
            .unwrap_or_default())
    }

    fn provider_name(&self) -> &'static str {
        "aws"
    }
}

#[async_trait]
impl NetworkProvider for AwsCliProvider {
    async fn create_vpc(&self, region: &str, cidr: &str, name: &str) -> ForgeResult<String> {
        let mut cmd_args = args(["--cidr-block", cidr]);
        cmd_args.push("--tag-specifications".to_string());
        cmd_args.push(tag_spec("vpc", &name_tag(name)));

        let response = self.call(region, "create-vpc", cmd_args).await?;
        string_field(&response, "/Vpc/VpcId", "create-vpc")
    }

    async fn enable_vpc_dns(&self, region: &str, vpc_id: &str) -> ForgeResult<()> {
        // One attribute per call
        for attribute in ["--enable-dns-support", "--enable-dns-hostnames"] {
            self.call(
                region,
                "modify-vpc-attribute",
                args(["--vpc-id", vpc_id, attribute, r#"{"Value":true}"#]),
            )
            .await?;
        }
        Ok(())
    }

    async fn vpc_available(&self, region: &str, vpc_id: &str) -> ForgeResult<bool> {
        let response = self
            .call(region, "describe-vpcs", args(["--vpc-ids", vpc_id]))
            .await?;
        Ok(response.pointer("/Vpcs/0/State").and_then(Value::as_str) == Some("available"))
    }

    async fn delete_vpc(&self, region: &str, vpc_id: &str) -> ForgeResult<bool> {
        self.delete(region, "delete-vpc", args(["--vpc-id", vpc_id]))
            .await
    }

    async fn create_internet_gateway(&self, region: &str, name: &str) -> ForgeResult<String> {
        let cmd_args = vec![
            "--tag-specifications".to_string(),
            tag_spec("internet-gateway", &name_tag(name)),
        ];
        let response = self.call(region, "create-internet-gateway", cmd_args).await?;
        string_field(
            &response,
            "/InternetGateway/InternetGatewayId",
            "create-internet-gateway",
        )
    }

    async fn attach_internet_gateway(
        &self,
        region: &str,
        gateway_id: &str,
        vpc_id: &str,
    ) -> ForgeResult<()> {
        self.call(
            region,
            "attach-internet-gateway",
            args(["--internet-gateway-id", gateway_id, "--vpc-id", vpc_id]),
        )
        .await?;
        Ok(())
    }

    async fn detach_internet_gateway(
        &self,
        region: &str,
        gateway_id: &str,
        vpc_id: &str,
    ) -> ForgeResult<bool> {
        self.delete(
            region,
            "detach-internet-gateway",
            args(["--internet-gateway-id", gateway_id, "--vpc-id", vpc_id]),
        )
        .await
    }

    async fn delete_internet_gateway(&self, region: &str, gateway_id: &str) -> ForgeResult<bool> {
        self.delete(
            region,
            "delete-internet-gateway",
            args(["--internet-gateway-id", gateway_id]),
        )
        .await
    }

    async fn create_subnet(&self, region: &str, request: &SubnetRequest) -> ForgeResult<String> {
        let mut cmd_args = args(["--vpc-id", &request.vpc_id, "--cidr-block", &request.cidr]);
        if let Some(az) = &request.availability_zone {
            cmd_args.extend(args(["--availability-zone", az]));
        }
        cmd_args.push("--tag-specifications".to_string());
        cmd_args.push(tag_spec("subnet", &name_tag(&request.name)));

        let response = self.call(region, "create-subnet", cmd_args).await?;
        let subnet_id = string_field(&response, "/Subnet/SubnetId", "create-subnet")?;

        if request.public_addressing {
            self.call(
                region,
                "modify-subnet-attribute",
                args(["--subnet-id", &subnet_id, "--map-public-ip-on-launch"]),
            )
            .await?;
        }

        Ok(subnet_id)
    }

    async fn delete_subnet(&self, region: &str, subnet_id: &str) -> ForgeResult<bool> {
        self.delete(region, "delete-subnet", args(["--subnet-id", subnet_id]))
            .await
    }

    async fn create_route_table(
        &self,
        region: &str,
        vpc_id: &str,
        name: &str,
    ) -> ForgeResult<String> {
        let mut cmd_args = args(["--vpc-id", vpc_id]);
        cmd_args.push("--tag-specifications".to_string());
        cmd_args.push(tag_spec("route-table", &name_tag(name)));

        let response = self.call(region, "create-route-table", cmd_args).await?;
        string_field(&response, "/RouteTable/RouteTableId", "create-route-table")
    }

    async fn create_default_route(
        &self,
        region: &str,
        route_table_id: &str,
        gateway_id: &str,
    ) -> ForgeResult<()> {
        self.call(
            region,
            "create-route",
            args([
                "--route-table-id",
                route_table_id,
                "--destination-cidr-block",
                "0.0.0.0/0",
                "--gateway-id",
                gateway_id,
            ]),
        )
        .await?;
        Ok(())
    }

    async fn associate_route_table(
        &self,
        region: &str,
        route_table_id: &str,
        subnet_id: &str,
    ) -> ForgeResult<()> {
        self.call(
            region,
            "associate-route-table",
            args(["--route-table-id", route_table_id, "--subnet-id", subnet_id]),
        )
        .await?;
        Ok(())
    }

    async fn delete_route_table(&self, region: &str, route_table_id: &str) -> ForgeResult<bool> {
        let described = match self
            .ec2(
                region,
                "describe-route-tables",
                &args(["--route-table-ids", route_table_id]),
            )
            .await
        {
            Ok(v) => v,
            Err(CliFailure::NotFound(_)) => return Ok(false),
            Err(failure) => return Err(failure.into()),
        };

        let associations: Vec<String> = described
            .pointer("/RouteTables/0/Associations")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|a| !a.get("Main").and_then(Value::as_bool).unwrap_or(false))
                    .filter_map(|a| a.get("RouteTableAssociationId")?.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        for association in associations {
            self.delete(
                region,
                "disassociate-route-table",
                args(["--association-id", &association]),
            )
            .await?;
        }

        self.delete(
            region,
            "delete-route-table",
            args(["--route-table-id", route_table_id]),
        )
        .await
    }

    async fn create_security_group(
        &self,
        region: &str,
        vpc_id: &str,
        name: &str,
    ) -> ForgeResult<String> {
        let description = format!("envforge cluster {}", name);
        let response = self
            .call(
                region,
                "create-security-group",
                args([
                    "--group-name",
                    name,
                    "--description",
                    &description,
                    "--vpc-id",
                    vpc_id,
                ]),
            )
            .await?;
        string_field(&response, "/GroupId", "create-security-group")
    }

    async fn authorize_ingress(
        &self,
        region: &str,
        group_id: &str,
        rule: &IngressRule,
    ) -> ForgeResult<()> {
        let permissions = match rule {
            IngressRule::Tcp { port, cidr } => json!([{
                "IpProtocol": "tcp",
                "FromPort": port,
                "ToPort": port,
                "IpRanges": [{ "CidrIp": cidr }],
            }]),
            IngressRule::SameGroup => json!([{
                "IpProtocol": "-1",
                "UserIdGroupPairs": [{ "GroupId": group_id }],
            }]),
        };

        self.call(
            region,
            "authorize-security-group-ingress",
            vec![
                "--group-id".to_string(),
                group_id.to_string(),
                "--ip-permissions".to_string(),
                permissions.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_security_group(&self, region: &str, group_id: &str) -> ForgeResult<bool> {
        self.delete(region, "delete-security-group", args(["--group-id", group_id]))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_spec_is_json() {
        let tags = BTreeMap::from([
            ("envforge:packages".to_string(), "gcc@11.3.0,openmpi@4.1.4".to_string()),
        ]);
        let spec: Value = serde_json::from_str(&tag_spec("image", &tags)).unwrap();
        assert_eq!(spec[0]["ResourceType"], "image");
        assert_eq!(spec[0]["Tags"][0]["Key"], "envforge:packages");
        assert_eq!(spec[0]["Tags"][0]["Value"], "gcc@11.3.0,openmpi@4.1.4");
    }

    #[test]
    fn parse_image_response() {
        let value = json!({
            "ImageId": "ami-0abc",
            "Name": "envforge-rocky9-1a2b3c4d",
            "State": "available",
            "CreationDate": "2024-05-01T10:00:00.000Z",
            "Tags": [{ "Key": "envforge:fingerprint", "Value": "deadbeef" }]
        });

        let image = parse_image(&value).unwrap();
        assert_eq!(image.id, "ami-0abc");
        assert_eq!(image.state, ImageState::Available);
        assert_eq!(image.tags["envforge:fingerprint"], "deadbeef");
        assert_eq!(image.created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn parse_image_without_id_is_skipped() {
        assert!(parse_image(&json!({ "Name": "x" })).is_none());
    }

    #[test]
    fn missing_field_is_provider_error() {
        let err = string_field(&json!({}), "/Vpc/VpcId", "create-vpc").unwrap_err();
        assert!(matches!(err, ForgeError::Provider { .. }));
    }
}
