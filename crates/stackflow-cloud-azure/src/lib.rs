//! Azure connector for Stackflow
//!
//! Implements the uniform lifecycle protocol on top of Azure Resource
//! Manager, accessed through the `az` CLI. A stack is one ARM template
//! deployment in a resource group named after the stack; managed databases
//! are PostgreSQL flexible servers. Launch is idempotent: an existing
//! deployment is reused instead of redeployed.

pub mod client;
pub mod connector;
pub mod error;
pub mod status;

pub use client::{ArmApi, ArmDeployment, ArmResourceRef, AzCli, DbServer, VmView};
pub use connector::AzureConnector;
pub use error::{AzureError, Result};
