//! Managed network environments
//!
//! A cluster needs a VPC with a public and a private subnet, an internet
//! gateway routed from the public subnet, and a security group. Creation is
//! all-or-nothing; deletion only ever touches environments envforge created.

mod environment;
mod provisioner;

pub use environment::{parse_cidr, validate_name, Cidr, NetworkEnvironment};
pub use provisioner::NetworkProvisioner;
