//! Content-addressed fingerprints for software environment specs
//!
//! Two specs with the same package multiset and the same version fields
//! always hash to the same value, regardless of package order. The hash is
//! the cache key for pre-built images.

use crate::error::{ForgeError, ForgeResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Number of package names carried in image tags
pub const TAGGED_PACKAGE_LIMIT: usize = 5;

/// Provider tag keys written on produced images
pub mod tags {
    /// Full fingerprint hash (used for provider-side lookups)
    pub const FINGERPRINT: &str = "envforge:fingerprint";
    /// Base OS identifier
    pub const BASE_OS: &str = "envforge:base-os";
    /// Compiler toolchain version
    pub const TOOLCHAIN_VERSION: &str = "envforge:toolchain-version";
    /// Module system version
    pub const MODULE_VERSION: &str = "envforge:module-version";
    /// Number of packages in the spec
    pub const PACKAGE_COUNT: &str = "envforge:package-count";
    /// First few package names, comma separated
    pub const PACKAGES: &str = "envforge:packages";
    /// Owning template name
    pub const TEMPLATE: &str = "envforge:template";
}

/// Declarative description of a software environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareSpec {
    /// Package specifiers, e.g. `gcc@11.3.0`; order is irrelevant
    #[serde(default)]
    pub packages: Vec<String>,

    /// Base OS identifier
    pub base_os: String,

    /// Toolchain (package manager) version
    #[serde(default)]
    pub toolchain_version: String,

    /// Module system version
    #[serde(default)]
    pub module_version: String,
}

impl SoftwareSpec {
    /// Create a spec from its parts
    pub fn new(
        packages: impl IntoIterator<Item = impl Into<String>>,
        base_os: impl Into<String>,
        toolchain_version: impl Into<String>,
        module_version: impl Into<String>,
    ) -> Self {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
            base_os: base_os.into(),
            toolchain_version: toolchain_version.into(),
            module_version: module_version.into(),
        }
    }

    /// Reject specs that cannot be canonicalised unambiguously
    pub fn validate(&self) -> ForgeResult<()> {
        if self.base_os.trim().is_empty() {
            return Err(ForgeError::Validation("base OS must not be empty".to_string()));
        }
        if self.packages.is_empty() {
            return Err(ForgeError::Validation(
                "at least one package is required".to_string(),
            ));
        }

        for pkg in &self.packages {
            if pkg.trim().is_empty() {
                return Err(ForgeError::Validation(
                    "package specifier must not be empty".to_string(),
                ));
            }
            if pkg.contains(|c: char| c == ',' || c == '|' || c.is_whitespace()) {
                return Err(ForgeError::Validation(format!(
                    "package specifier '{}' contains whitespace or a reserved character (',' '|')",
                    pkg
                )));
            }
        }

        for (field, value) in [
            ("base OS", &self.base_os),
            ("toolchain version", &self.toolchain_version),
            ("module version", &self.module_version),
        ] {
            if value.contains('|') {
                return Err(ForgeError::Validation(format!(
                    "{} '{}' contains reserved character '|'",
                    field, value
                )));
            }
        }

        Ok(())
    }
}

/// Derived cache key of a [`SoftwareSpec`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Hex SHA-256 of the canonical form
    pub hash: String,
    /// Packages in canonical (sorted) order
    pub packages: Vec<String>,
    pub base_os: String,
    pub toolchain_version: String,
    pub module_version: String,
}

impl Fingerprint {
    /// Compute the fingerprint of a spec
    pub fn compute(spec: &SoftwareSpec) -> ForgeResult<Self> {
        spec.validate()?;

        let mut packages = spec.packages.clone();
        packages.sort();

        let canonical = canonical_form(
            &packages,
            &spec.base_os,
            &spec.toolchain_version,
            &spec.module_version,
        );

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash = hex::encode(hasher.finalize());

        Ok(Self {
            hash,
            packages,
            base_os: spec.base_os.clone(),
            toolchain_version: spec.toolchain_version.clone(),
            module_version: spec.module_version.clone(),
        })
    }

    /// First 8 hex characters of the hash
    pub fn short_hash(&self) -> &str {
        &self.hash[..8.min(self.hash.len())]
    }

    /// Human-readable tag, e.g. `rocky9-0.21.0-1a2b3c4d`
    pub fn short_tag(&self) -> String {
        let os: String = self
            .base_os
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect::<String>()
            .to_ascii_lowercase();

        if self.toolchain_version.is_empty() {
            format!("{}-{}", os, self.short_hash())
        } else {
            format!("{}-{}-{}", os, self.toolchain_version, self.short_hash())
        }
    }

    /// Metadata tags attached to a produced image so it stays discoverable
    /// without the local cache index
    pub fn tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(tags::FINGERPRINT.to_string(), self.hash.clone());
        tags.insert(tags::BASE_OS.to_string(), self.base_os.clone());
        tags.insert(
            tags::TOOLCHAIN_VERSION.to_string(),
            self.toolchain_version.clone(),
        );
        tags.insert(tags::MODULE_VERSION.to_string(), self.module_version.clone());
        tags.insert(
            tags::PACKAGE_COUNT.to_string(),
            self.packages.len().to_string(),
        );

        let mut listed = self
            .packages
            .iter()
            .take(TAGGED_PACKAGE_LIMIT)
            .cloned()
            .collect::<Vec<_>>()
            .join(",");
        // Provider tag values are capped at 256 characters
        if listed.len() > 255 {
            let mut cut = 255;
            while !listed.is_char_boundary(cut) {
                cut -= 1;
            }
            listed.truncate(cut);
        }
        tags.insert(tags::PACKAGES.to_string(), listed);
        tags
    }
}

fn canonical_form(packages: &[String], base_os: &str, toolchain: &str, modules: &str) -> String {
    format!(
        "os={}|toolchain={}|modules={}|packages={}",
        base_os,
        toolchain,
        modules,
        packages.join(",")
    )
}
