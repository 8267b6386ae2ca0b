//! AWS connector for Stackflow
//!
//! Implements the uniform lifecycle protocol on top of EC2 and
//! CloudFormation, accessed through the `aws` CLI (v2). Instance power
//! operations are idempotent: instances already in the requested state are
//! skipped, and mutations are followed by a convergence wait.

pub mod client;
pub mod connector;
pub mod error;
pub mod status;

pub use client::{AwsCli, CfnResourceSummary, CfnStack, Ec2Api, Ec2Instance};
pub use connector::AwsConnector;
pub use error::{AwsError, Result};
