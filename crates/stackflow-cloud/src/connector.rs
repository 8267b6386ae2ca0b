//! Cloud connector trait definition
//!
//! Each provider implements this capability set to expose one uniform
//! lifecycle protocol. Callers request outcomes (launch, stop, upscale) and
//! get back converged, provider-agnostic status lists; the connector hides
//! the provider's asynchronous and eventually-consistent mechanics.

use crate::context::AuthenticatedContext;
use crate::error::Result;
use crate::model::{
    AdjustmentType, CloudInstance, CloudResource, CloudResourceStatus, CloudStack,
    CloudVmInstanceStatus, DatabaseStack, ExternalDatabaseStatus, Platform,
};
use crate::notifier::PersistenceNotifier;
use async_trait::async_trait;

/// Uniform lifecycle protocol over one cloud provider.
///
/// Operations are synchronous from the caller's point of view: mutations
/// that are asynchronous on the provider side block (poll) until the
/// provider reaches a terminal state. Concurrent calls for the same stack
/// are the caller's responsibility to serialize.
#[async_trait]
pub trait CloudConnector: Send + Sync {
    fn platform(&self) -> Platform;

    /// Provision all resources for a stack. Idempotent against partial
    /// prior execution: resources discovered or created so far are persisted
    /// through the notifier before returning, on the failure path too, and
    /// existing provider-side deployments are reused rather than recreated.
    async fn launch(
        &self,
        context: &AuthenticatedContext,
        stack: &CloudStack,
        notifier: &dyn PersistenceNotifier,
        adjustment: AdjustmentType,
        threshold: u64,
    ) -> Result<Vec<CloudResourceStatus>>;

    /// Query current provider state for the given resources without
    /// mutating anything. Resources the provider no longer reports map to
    /// `Deleted`; unknown resource types are rejected.
    async fn check(
        &self,
        context: &AuthenticatedContext,
        resources: &[CloudResource],
    ) -> Result<Vec<CloudResourceStatus>>;

    /// Query current provider state for the given instances. Instances the
    /// provider reports as gone are dropped from the result.
    async fn check_instances(
        &self,
        context: &AuthenticatedContext,
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudVmInstanceStatus>>;

    /// Power on instances not already started, then wait until every
    /// requested instance reaches `Started` or `Failed`.
    async fn start(
        &self,
        context: &AuthenticatedContext,
        resources: &[CloudResource],
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudVmInstanceStatus>>;

    /// Power off instances not already stopped, then wait until every
    /// requested instance reaches `Stopped` or `Failed`.
    async fn stop(
        &self,
        context: &AuthenticatedContext,
        resources: &[CloudResource],
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudVmInstanceStatus>>;

    /// Stop-then-start the instances that are currently started. Instances
    /// in any other state are logged and left untouched; a failure on one
    /// instance never aborts the batch.
    async fn reboot(
        &self,
        context: &AuthenticatedContext,
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudVmInstanceStatus>>;

    /// Grow the stack to the desired topology.
    async fn upscale(
        &self,
        context: &AuthenticatedContext,
        stack: &CloudStack,
        resources: &[CloudResource],
    ) -> Result<Vec<CloudResourceStatus>>;

    /// Terminate exactly the resources previously computed by
    /// [`CloudConnector::collect_resources_to_remove`].
    async fn downscale(
        &self,
        context: &AuthenticatedContext,
        stack: &CloudStack,
        resources: &[CloudResource],
        instances: &[CloudInstance],
        to_remove: Vec<CloudResource>,
        notifier: &dyn PersistenceNotifier,
    ) -> Result<Vec<CloudResourceStatus>>;

    /// Compute the deletable subset for a downscale: resources bound to the
    /// given instances plus provider-specific dependents.
    async fn collect_resources_to_remove(
        &self,
        context: &AuthenticatedContext,
        stack: &CloudStack,
        resources: &[CloudResource],
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudResource>>;

    /// Remove all resources of a stack. Already-gone resources count as
    /// successfully deleted.
    async fn terminate(
        &self,
        context: &AuthenticatedContext,
        stack: &CloudStack,
        resources: &[CloudResource],
        notifier: &dyn PersistenceNotifier,
    ) -> Result<Vec<CloudResourceStatus>>;

    /// Apply template/parameter changes to an existing stack.
    async fn update(
        &self,
        context: &AuthenticatedContext,
        stack: &CloudStack,
        resources: &[CloudResource],
    ) -> Result<Vec<CloudResourceStatus>>;

    /// Reconcile provider-side load balancers with the desired stack.
    async fn update_load_balancers(
        &self,
        context: &AuthenticatedContext,
        stack: &CloudStack,
        notifier: &dyn PersistenceNotifier,
    ) -> Result<Vec<CloudResourceStatus>>;

    /// Provision a managed database server.
    async fn launch_database_server(
        &self,
        context: &AuthenticatedContext,
        stack: &DatabaseStack,
        notifier: &dyn PersistenceNotifier,
    ) -> Result<Vec<CloudResourceStatus>>;

    /// Remove a managed database server. With `force`, provider errors are
    /// logged and the records dropped anyway.
    async fn terminate_database_server(
        &self,
        context: &AuthenticatedContext,
        stack: &DatabaseStack,
        resources: &[CloudResource],
        notifier: &dyn PersistenceNotifier,
        force: bool,
    ) -> Result<Vec<CloudResourceStatus>>;

    async fn database_server_status(
        &self,
        context: &AuthenticatedContext,
        stack: &DatabaseStack,
    ) -> Result<ExternalDatabaseStatus>;
}
