//! Network environment record and address validation

use crate::error::{ForgeError, ForgeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use tokio::fs;

/// Networking resources one cluster runs in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEnvironment {
    /// Name the resources were created under
    pub name: String,
    pub region: String,
    pub vpc_id: String,
    pub gateway_id: String,
    pub public_subnet_id: String,
    pub private_subnet_id: String,
    pub route_table_id: String,
    pub security_group_id: String,
    /// Created by envforge, and therefore deletable by it
    pub managed: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl NetworkEnvironment {
    /// Load an environment document
    pub async fn load(path: &Path) -> ForgeResult<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ForgeError::io(format!("reading network file {}", path.display()), e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the environment as pretty JSON
    pub async fn save(&self, path: &Path) -> ForgeResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ForgeError::io("creating network file directory", e))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .await
            .map_err(|e| ForgeError::io(format!("writing network file {}", path.display()), e))
    }
}

/// An IPv4 block in `a.b.c.d/n` form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Cidr {
    /// Whether `other` lies entirely inside this block
    pub fn contains(&self, other: &Cidr) -> bool {
        other.prefix >= self.prefix && other.network() & self.mask() == self.network()
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    fn network(&self) -> u32 {
        u32::from(self.address) & self.mask()
    }
}

/// Parse an IPv4 CIDR block such as `10.0.0.0/16`.
///
/// `field` names the setting in error messages.
pub fn parse_cidr(s: &str, field: &str) -> ForgeResult<Cidr> {
    let s = s.trim();

    let (addr, prefix) = s.split_once('/').ok_or_else(|| {
        ForgeError::Validation(format!(
            "Invalid CIDR '{}' for {}. Expected format: a.b.c.d/n",
            s, field
        ))
    })?;

    let address: Ipv4Addr = addr.parse().map_err(|_| {
        ForgeError::Validation(format!("Invalid address '{}' in {} '{}'", addr, field, s))
    })?;

    let prefix: u8 = prefix.parse().map_err(|_| {
        ForgeError::Validation(format!(
            "Invalid prefix length '{}' in {} '{}'. Must be 0-32",
            prefix, field, s
        ))
    })?;

    if prefix > 32 {
        return Err(ForgeError::Validation(format!(
            "Prefix length {} in {} '{}' is out of range. Must be 0-32",
            prefix, field, s
        )));
    }

    Ok(Cidr { address, prefix })
}

/// Validate a network name used for resource Name tags
pub fn validate_name(name: &str) -> ForgeResult<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(ForgeError::Validation(
            "Network name must be 1-64 characters".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ForgeError::Validation(format!(
            "Network name '{}' may only contain letters, digits, '-' and '_'",
            name
        )));
    }
    Ok(())
}
