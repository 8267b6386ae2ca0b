//! Per-call context types
//!
//! The external credential subsystem authenticates a provider client and
//! hands the connector an [`AuthenticatedContext`] carrying the stack
//! identity and target location. The connectors never manage credentials
//! themselves.

use crate::model::Platform;
use serde::{Deserialize, Serialize};

/// Target region and optional availability zone within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub region: String,
    pub availability_zone: Option<String>,
}

impl Location {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            availability_zone: None,
        }
    }

}

/// Identity of the stack a connector call operates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudContext {
    pub id: u64,
    pub name: String,
    pub platform: Platform,
    pub location: Location,
}

impl CloudContext {
    pub fn new(id: u64, name: impl Into<String>, platform: Platform, location: Location) -> Self {
        Self {
            id,
            name: name.into(),
            platform,
            location,
        }
    }
}

/// Bundle passed to every connector operation. The authenticated provider
/// client handle lives in the connector value itself (it is built from the
/// credential subsystem's client); the context contributes stack identity
/// and location.
#[derive(Debug, Clone)]
pub struct AuthenticatedContext {
    pub cloud_context: CloudContext,
}

impl AuthenticatedContext {
    pub fn new(cloud_context: CloudContext) -> Self {
        Self { cloud_context }
    }

    pub fn stack_name(&self) -> &str {
        &self.cloud_context.name
    }

    pub fn region(&self) -> &str {
        &self.cloud_context.location.region
    }
}
