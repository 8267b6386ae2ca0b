//! Domain model for cloud resources and instances
//!
//! These are the plain value types exchanged between the orchestrator and
//! the provider connectors. Nothing in here talks to a provider; durability
//! is delegated to the [`crate::notifier::PersistenceNotifier`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cloud platform a resource or connector belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Aws,
    Azure,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Aws => write!(f, "aws"),
            Platform::Azure => write!(f, "azure"),
        }
    }
}

/// Closed, provider-namespaced set of resource kinds the connectors manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    // AWS
    AwsCloudFormationStack,
    AwsInstance,
    AwsVolume,
    AwsNetwork,
    AwsLoadBalancer,
    // Azure
    AzureTemplateDeployment,
    AzureInstance,
    AzureManagedDisk,
    AzureNetwork,
    AzureLoadBalancer,
    AzureDatabaseServer,
}

impl ResourceType {
    pub fn platform(&self) -> Platform {
        match self {
            ResourceType::AwsCloudFormationStack
            | ResourceType::AwsInstance
            | ResourceType::AwsVolume
            | ResourceType::AwsNetwork
            | ResourceType::AwsLoadBalancer => Platform::Aws,
            ResourceType::AzureTemplateDeployment
            | ResourceType::AzureInstance
            | ResourceType::AzureManagedDisk
            | ResourceType::AzureNetwork
            | ResourceType::AzureLoadBalancer
            | ResourceType::AzureDatabaseServer => Platform::Azure,
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceType::AwsCloudFormationStack => "aws_cloudformation_stack",
            ResourceType::AwsInstance => "aws_instance",
            ResourceType::AwsVolume => "aws_volume",
            ResourceType::AwsNetwork => "aws_network",
            ResourceType::AwsLoadBalancer => "aws_load_balancer",
            ResourceType::AzureTemplateDeployment => "azure_template_deployment",
            ResourceType::AzureInstance => "azure_instance",
            ResourceType::AzureManagedDisk => "azure_managed_disk",
            ResourceType::AzureNetwork => "azure_network",
            ResourceType::AzureLoadBalancer => "azure_load_balancer",
            ResourceType::AzureDatabaseServer => "azure_database_server",
        };
        write!(f, "{name}")
    }
}

/// One provider-side artifact of any kind (VM, disk, network, deployment,
/// managed database). Discovered or created by a connector, durably tracked
/// by the persistence gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudResource {
    pub resource_type: ResourceType,

    /// Provider-side name of the artifact.
    pub name: String,

    /// Provider instance id when the resource is bound to a compute unit.
    pub instance_id: Option<String>,

    /// Whether the gateway should keep the record across calls.
    pub persistent: bool,

    /// Provider-specific metadata (ids, sizes, attachment info).
    pub parameters: HashMap<String, serde_json::Value>,
}

impl CloudResource {
    pub fn new(resource_type: ResourceType, name: impl Into<String>) -> Self {
        Self {
            resource_type,
            name: name.into(),
            instance_id: None,
            persistent: true,
            parameters: HashMap::new(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Gateway key: one record per (type, name).
    pub fn key(&self) -> String {
        format!("{}:{}", self.resource_type, self.name)
    }
}

/// One compute unit within a stack. Constructed per-call from the caller's
/// desired topology; `instance_id` is absent until the provider has
/// provisioned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudInstance {
    pub instance_id: Option<String>,

    /// Logical group (template reference) the instance belongs to.
    pub group: String,

    pub parameters: HashMap<String, serde_json::Value>,
}

impl CloudInstance {
    pub fn new(instance_id: Option<String>, group: impl Into<String>) -> Self {
        Self {
            instance_id,
            group: group.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }
}

/// Canonical instance lifecycle status. Every provider-native status maps to
/// exactly one of these; unmapped vocabulary maps to `Unknown`, never to an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Created,
    Started,
    Stopped,
    InProgress,
    Failed,
    Terminated,
    Unknown,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceStatus::Created => "created",
            InstanceStatus::Started => "started",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::InProgress => "in_progress",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Terminated => "terminated",
            InstanceStatus::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Canonical status for non-instance resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Created,
    Updated,
    Deleted,
    InProgress,
    Failed,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceStatus::Created => "created",
            ResourceStatus::Updated => "updated",
            ResourceStatus::Deleted => "deleted",
            ResourceStatus::InProgress => "in_progress",
            ResourceStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Status of a managed database server as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalDatabaseStatus {
    Started,
    Stopped,
    UpdateInProgress,
    Deleted,
    Unknown,
}

/// A (instance, status) pair produced by a check operation. Transient,
/// returned up the call chain and never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudVmInstanceStatus {
    pub instance: CloudInstance,
    pub status: InstanceStatus,
    pub reason: Option<String>,
}

impl CloudVmInstanceStatus {
    pub fn new(instance: CloudInstance, status: InstanceStatus) -> Self {
        Self {
            instance,
            status,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A (resource, status) pair produced by a check operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudResourceStatus {
    pub resource: CloudResource,
    pub status: ResourceStatus,
    pub reason: Option<String>,
}

impl CloudResourceStatus {
    pub fn new(resource: CloudResource, status: ResourceStatus) -> Self {
        Self {
            resource,
            status,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A named group of instances sharing one template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub name: String,
    pub instances: Vec<CloudInstance>,
}

impl InstanceGroup {
    pub fn new(name: impl Into<String>, instances: Vec<CloudInstance>) -> Self {
        Self {
            name: name.into(),
            instances,
        }
    }
}

/// The caller's desired topology for one stack: instance groups plus the
/// provider template to realize them with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudStack {
    pub groups: Vec<InstanceGroup>,

    /// Provider template body (CloudFormation / ARM), when the platform is
    /// template driven.
    pub template: Option<String>,

    pub parameters: HashMap<String, serde_json::Value>,
}

impl CloudStack {
    pub fn new(groups: Vec<InstanceGroup>) -> Self {
        Self {
            groups,
            template: None,
            parameters: HashMap::new(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn instances(&self) -> impl Iterator<Item = &CloudInstance> {
        self.groups.iter().flat_map(|g| g.instances.iter())
    }
}

/// Desired state of one managed database server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStack {
    pub server_name: String,
    pub engine: String,
    pub template: Option<String>,
    pub parameters: HashMap<String, serde_json::Value>,
}

impl DatabaseStack {
    pub fn new(server_name: impl Into<String>, engine: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            engine: engine.into(),
            template: None,
            parameters: HashMap::new(),
        }
    }
}

/// How strictly a launch must honor the requested node count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentType {
    /// Fail unless at least `threshold` nodes come up.
    Exact,
    /// Fail unless `threshold` percent of the nodes come up.
    Percentage,
    /// Accept whatever the provider managed to create.
    BestEffort,
}
