//! Azure connector implementation
//!
//! The stack is realized as one ARM template deployment inside a resource
//! group named after the stack. VMs are managed with start/deallocate,
//! managed databases as PostgreSQL flexible servers. All provider calls go
//! through the retry wrapper; asynchronous mutations hand off to the
//! convergence poller.

use crate::client::{ArmApi, ArmResourceRef, AzCli};
use crate::status;
use async_trait::async_trait;
use stackflow_cloud::connector::CloudConnector;
use stackflow_cloud::context::AuthenticatedContext;
use stackflow_cloud::error::{CloudError, Result};
use stackflow_cloud::model::{
    AdjustmentType, CloudInstance, CloudResource, CloudResourceStatus, CloudStack,
    CloudVmInstanceStatus, DatabaseStack, ExternalDatabaseStatus, InstanceStatus, Platform,
    ResourceStatus, ResourceType,
};
use stackflow_cloud::notifier::PersistenceNotifier;
use stackflow_cloud::poller::wait_for_statuses;
use stackflow_cloud::retry::with_retries;
use stackflow_cloud::scaling::{deletable_resources, meets_adjustment};
use stackflow_cloud::ConnectorConfig;
use std::collections::HashSet;
use std::sync::Arc;

/// Azure implementation of the uniform lifecycle protocol.
pub struct AzureConnector {
    client: Arc<dyn ArmApi>,
    config: ConnectorConfig,
}

impl AzureConnector {
    pub fn new(client: Arc<dyn ArmApi>, config: ConnectorConfig) -> Self {
        Self { client, config }
    }

    /// Connector backed by the `az` CLI.
    pub fn from_cli(config: ConnectorConfig) -> Self {
        Self::new(Arc::new(AzCli::new()), config)
    }

    fn with_ids(instances: &[CloudInstance]) -> Vec<CloudInstance> {
        instances
            .iter()
            .filter(|i| i.instance_id().is_some())
            .cloned()
            .collect()
    }

    /// Current status of every VM that still exists. VMs the provider no
    /// longer knows are skipped with a warning, not failed.
    async fn vm_statuses(
        &self,
        resource_group: String,
        vms: Vec<CloudInstance>,
    ) -> Result<Vec<CloudVmInstanceStatus>> {
        let mut statuses = Vec::new();
        for vm in &vms {
            let Some(name) = vm.instance_id() else {
                continue;
            };
            let client = Arc::clone(&self.client);
            let rg = resource_group.clone();
            let vm_name = name.to_string();
            let view = with_retries(&self.config.retry, "vm get-instance-view", || {
                let client = Arc::clone(&client);
                let rg = rg.clone();
                let vm_name = vm_name.clone();
                async move { client.get_vm_view(&rg, &vm_name).await.map_err(CloudError::from) }
            })
            .await?;
            match view {
                Some(view) => {
                    tracing::debug!("VM {} is '{}' on provider side", view.name, view.power_state);
                    let mapped =
                        status::instance_status(&view.power_state, &view.provisioning_state);
                    let mut entry = CloudVmInstanceStatus::new(vm.clone(), mapped);
                    if mapped == InstanceStatus::Failed {
                        entry = entry.with_reason(format!(
                            "provisioning state {}",
                            view.provisioning_state
                        ));
                    }
                    statuses.push(entry);
                }
                None => {
                    tracing::warn!("VM {vm_name} no longer exists, removing from working set");
                }
            }
        }
        Ok(statuses)
    }

    /// Drive VMs toward started or deallocated: mutate only the ones not
    /// already there, then wait for convergence.
    async fn set_power_state(
        &self,
        resource_group: &str,
        instances: &[CloudInstance],
        start: bool,
    ) -> Result<Vec<CloudVmInstanceStatus>> {
        let vms = Self::with_ids(instances);
        if vms.is_empty() {
            return Ok(Vec::new());
        }

        let target = if start {
            InstanceStatus::Started
        } else {
            InstanceStatus::Stopped
        };
        let operation = if start { "vm start" } else { "vm deallocate" };

        let current = self.vm_statuses(resource_group.to_string(), vms.clone()).await?;
        for entry in current.iter().filter(|s| s.status != target) {
            let Some(name) = entry.instance.instance_id() else {
                continue;
            };
            let client = Arc::clone(&self.client);
            let rg = resource_group.to_string();
            let vm_name = name.to_string();
            let result = with_retries(&self.config.retry, operation, || {
                let client = Arc::clone(&client);
                let rg = rg.clone();
                let vm_name = vm_name.clone();
                async move {
                    if start {
                        client.start_vm(&rg, &vm_name).await.map_err(CloudError::from)
                    } else {
                        client.deallocate_vm(&rg, &vm_name).await.map_err(CloudError::from)
                    }
                }
            })
            .await;
            match result {
                Ok(()) => {}
                Err(CloudError::NotFound(_)) => {
                    tracing::warn!("VM {vm_name} disappeared before {operation}, dropping it");
                }
                Err(e) => return Err(e),
            }
        }

        let targets: HashSet<InstanceStatus> = [target].into_iter().collect();
        let rg = resource_group.to_string();
        let poll = wait_for_statuses(&self.config.poller, vms, &targets, None, |batch| {
            let rg = rg.clone();
            async move { self.vm_statuses(rg, batch).await }
        })
        .await?;
        Ok(poll.statuses)
    }

    async fn get_deployment_with_retries(
        &self,
        resource_group: &str,
        deployment: &str,
    ) -> Result<Option<crate::client::ArmDeployment>> {
        let client = Arc::clone(&self.client);
        let rg = resource_group.to_string();
        let name = deployment.to_string();
        with_retries(&self.config.retry, "deployment group show", || {
            let client = Arc::clone(&client);
            let rg = rg.clone();
            let name = name.clone();
            async move { client.get_deployment(&rg, &name).await.map_err(CloudError::from) }
        })
        .await
    }

    async fn collect_deployment_resources(
        &self,
        resource_group: &str,
        deployment: &str,
    ) -> Result<Vec<CloudResource>> {
        let client = Arc::clone(&self.client);
        let rg = resource_group.to_string();
        let name = deployment.to_string();
        let refs = with_retries(&self.config.retry, "deployment resource listing", || {
            let client = Arc::clone(&client);
            let rg = rg.clone();
            let name = name.clone();
            async move {
                client
                    .list_deployment_resources(&rg, &name)
                    .await
                    .map_err(CloudError::from)
            }
        })
        .await?;

        let mut resources = vec![CloudResource::new(
            ResourceType::AzureTemplateDeployment,
            deployment,
        )];
        for reference in refs {
            if let Some(resource) = cloud_resource_from_ref(&reference) {
                resources.push(resource);
            } else {
                tracing::debug!("ignoring untracked ARM resource {}", reference.id);
            }
        }
        Ok(resources)
    }

    async fn persist_discovered(
        &self,
        context: &AuthenticatedContext,
        notifier: &dyn PersistenceNotifier,
        resources: &[CloudResource],
    ) -> Result<()> {
        notifier
            .delete_resources(&context.cloud_context, resources)
            .await?;
        notifier
            .save_resources(&context.cloud_context, resources)
            .await?;
        tracing::info!(
            "persisted {} resource(s) for stack {}",
            resources.len(),
            context.stack_name()
        );
        Ok(())
    }
}

fn cloud_resource_from_ref(reference: &ArmResourceRef) -> Option<CloudResource> {
    let provider_type = reference.provider_type()?;
    let resource_type = match provider_type.as_str() {
        "Microsoft.Compute/virtualMachines" => ResourceType::AzureInstance,
        "Microsoft.Compute/disks" => ResourceType::AzureManagedDisk,
        "Microsoft.Network/virtualNetworks"
        | "Microsoft.Network/networkInterfaces"
        | "Microsoft.Network/networkSecurityGroups"
        | "Microsoft.Network/publicIPAddresses" => ResourceType::AzureNetwork,
        "Microsoft.Network/loadBalancers" => ResourceType::AzureLoadBalancer,
        t if t.starts_with("Microsoft.DBforPostgreSQL") => ResourceType::AzureDatabaseServer,
        _ => return None,
    };
    let mut resource = CloudResource::new(resource_type, reference.name());
    if resource_type == ResourceType::AzureInstance {
        resource = resource.with_instance_id(reference.name());
    }
    Some(resource)
}

/// Warn about instances that cannot take part in an operation because they
/// are not in the expected state. They are skipped, not failed.
fn log_invalid_statuses(invalid: &[CloudVmInstanceStatus], expected: InstanceStatus) {
    if invalid.is_empty() {
        return;
    }
    let detail: Vec<String> = invalid
        .iter()
        .map(|s| {
            format!(
                "VM {} has status {}",
                s.instance.instance_id().unwrap_or("<unprovisioned>"),
                s.status
            )
        })
        .collect();
    tracing::warn!(
        "unable to reboot {}. Instances should be in {} state.",
        detail.join(", "),
        expected
    );
}

#[async_trait]
impl CloudConnector for AzureConnector {
    fn platform(&self) -> Platform {
        Platform::Azure
    }

    async fn launch(
        &self,
        context: &AuthenticatedContext,
        stack: &CloudStack,
        notifier: &dyn PersistenceNotifier,
        adjustment: AdjustmentType,
        threshold: u64,
    ) -> Result<Vec<CloudResourceStatus>> {
        let stack_name = context.stack_name().to_string();
        let template = stack.template.clone().ok_or_else(|| {
            CloudError::Rejected(format!("stack {stack_name} has no ARM template"))
        })?;
        tracing::info!(
            "launching stack {stack_name} ({:?}, threshold {threshold})",
            adjustment
        );

        let mut persisted = false;
        let launch_result: Result<()> = async {
            let existing = self.get_deployment_with_retries(&stack_name, &stack_name).await?;
            if existing.is_some() {
                tracing::info!("ARM deployment {stack_name} already exists, reusing it");
            } else {
                let client = Arc::clone(&self.client);
                let rg = stack_name.clone();
                let name = stack_name.clone();
                let body = template.clone();
                with_retries(&self.config.retry, "deployment group create", || {
                    let client = Arc::clone(&client);
                    let rg = rg.clone();
                    let name = name.clone();
                    let body = body.clone();
                    async move {
                        client
                            .create_deployment(&rg, &name, &body)
                            .await
                            .map_err(CloudError::from)
                    }
                })
                .await?;
            }

            let resources = self.collect_deployment_resources(&stack_name, &stack_name).await?;
            self.persist_discovered(context, notifier, &resources).await?;
            persisted = true;

            let created = resources
                .iter()
                .filter(|r| r.resource_type == ResourceType::AzureInstance)
                .count();
            let requested = stack.instances().count();
            if !meets_adjustment(created, requested, adjustment, threshold) {
                return Err(CloudError::connector(
                    &stack_name,
                    "launch",
                    format!(
                        "only {created} of {requested} instances came up, below the {:?} threshold {threshold}",
                        adjustment
                    ),
                ));
            }
            Ok(())
        }
        .await;

        if !persisted {
            // The launch body failed before it could persist. Record
            // whatever the provider already reports so a retrying caller
            // does not lose track of created resources.
            match self.collect_deployment_resources(&stack_name, &stack_name).await {
                Ok(resources) => {
                    if let Err(e) = self.persist_discovered(context, notifier, &resources).await {
                        tracing::warn!("failed to persist partially created resources: {e}");
                    }
                }
                Err(e) => {
                    tracing::debug!("no partially created resources to persist: {e}");
                }
            }
        }
        launch_result?;

        let template_resource =
            CloudResource::new(ResourceType::AzureTemplateDeployment, &stack_name);
        let statuses = self.check(context, &[template_resource]).await?;
        tracing::debug!("launched resources: {statuses:?}");
        Ok(statuses)
    }

    async fn check(
        &self,
        context: &AuthenticatedContext,
        resources: &[CloudResource],
    ) -> Result<Vec<CloudResourceStatus>> {
        let resource_group = context.stack_name();
        let mut result = Vec::new();
        for resource in resources {
            match resource.resource_type {
                ResourceType::AzureTemplateDeployment => {
                    match self.get_deployment_with_retries(resource_group, &resource.name).await {
                        Ok(Some(deployment)) => {
                            result.push(
                                CloudResourceStatus::new(
                                    resource.clone(),
                                    status::resource_status(&deployment.provisioning_state),
                                )
                                .with_reason(deployment.provisioning_state),
                            );
                        }
                        Ok(None) => {
                            result.push(CloudResourceStatus::new(
                                resource.clone(),
                                ResourceStatus::Deleted,
                            ));
                        }
                        Err(CloudError::NotFound(_)) => {
                            result.push(CloudResourceStatus::new(
                                resource.clone(),
                                ResourceStatus::Deleted,
                            ));
                        }
                        Err(e) => return Err(e),
                    }
                }
                other if other.platform() == Platform::Azure => {
                    // Tracked through the template deployment; no
                    // standalone status to report.
                }
                other => {
                    return Err(CloudError::Rejected(format!(
                        "invalid resource type for the Azure connector: {other}"
                    )));
                }
            }
        }
        Ok(result)
    }

    async fn check_instances(
        &self,
        context: &AuthenticatedContext,
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudVmInstanceStatus>> {
        let vms = Self::with_ids(instances);
        tracing::debug!("checking {} VM(s) on provider side", vms.len());
        if vms.is_empty() {
            return Ok(Vec::new());
        }
        self.vm_statuses(context.stack_name().to_string(), vms).await
    }

    async fn start(
        &self,
        context: &AuthenticatedContext,
        _resources: &[CloudResource],
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudVmInstanceStatus>> {
        self.set_power_state(context.stack_name(), instances, true).await
    }

    async fn stop(
        &self,
        context: &AuthenticatedContext,
        _resources: &[CloudResource],
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudVmInstanceStatus>> {
        self.set_power_state(context.stack_name(), instances, false).await
    }

    async fn reboot(
        &self,
        context: &AuthenticatedContext,
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudVmInstanceStatus>> {
        let mut rebooted = Vec::new();
        if instances.is_empty() {
            return Ok(rebooted);
        }

        let statuses = self.check_instances(context, instances).await?;
        let (candidates, skipped): (Vec<_>, Vec<_>) = statuses
            .into_iter()
            .partition(|s| s.status == InstanceStatus::Started);
        log_invalid_statuses(&skipped, InstanceStatus::Started);

        for candidate in &candidates {
            if let Err(e) = self
                .stop(context, &[], std::slice::from_ref(&candidate.instance))
                .await
            {
                tracing::warn!(
                    "unable to stop VM {} for reboot: {e}",
                    candidate.instance.instance_id().unwrap_or("<unprovisioned>")
                );
            }
        }

        let candidate_instances: Vec<CloudInstance> =
            candidates.into_iter().map(|s| s.instance).collect();
        let statuses = self.check_instances(context, &candidate_instances).await?;
        let (stopped, not_stopped): (Vec<_>, Vec<_>) = statuses
            .into_iter()
            .partition(|s| s.status == InstanceStatus::Stopped);
        log_invalid_statuses(&not_stopped, InstanceStatus::Stopped);

        for entry in stopped {
            match self
                .start(context, &[], std::slice::from_ref(&entry.instance))
                .await
            {
                Ok(statuses) => rebooted.extend(statuses),
                Err(e) => {
                    tracing::warn!(
                        "unable to start VM {} after reboot stop: {e}",
                        entry.instance.instance_id().unwrap_or("<unprovisioned>")
                    );
                }
            }
        }
        Ok(rebooted)
    }

    async fn upscale(
        &self,
        context: &AuthenticatedContext,
        stack: &CloudStack,
        _resources: &[CloudResource],
    ) -> Result<Vec<CloudResourceStatus>> {
        let stack_name = context.stack_name().to_string();
        let template = stack.template.clone().ok_or_else(|| {
            CloudError::Rejected(format!("stack {stack_name} has no ARM template"))
        })?;
        tracing::info!("upscaling stack {stack_name}");

        // ARM deployments are incremental: re-running the deployment with
        // the widened template adds the new resources.
        let client = Arc::clone(&self.client);
        let rg = stack_name.clone();
        let name = stack_name.clone();
        with_retries(&self.config.retry, "deployment group create", || {
            let client = Arc::clone(&client);
            let rg = rg.clone();
            let name = name.clone();
            let body = template.clone();
            async move {
                client
                    .create_deployment(&rg, &name, &body)
                    .await
                    .map_err(CloudError::from)
            }
        })
        .await?;

        let template_resource =
            CloudResource::new(ResourceType::AzureTemplateDeployment, &stack_name);
        self.check(context, &[template_resource]).await
    }

    async fn downscale(
        &self,
        context: &AuthenticatedContext,
        _stack: &CloudStack,
        _resources: &[CloudResource],
        _instances: &[CloudInstance],
        to_remove: Vec<CloudResource>,
        notifier: &dyn PersistenceNotifier,
    ) -> Result<Vec<CloudResourceStatus>> {
        let resource_group = context.stack_name().to_string();
        for resource in to_remove
            .iter()
            .filter(|r| r.resource_type == ResourceType::AzureInstance)
        {
            let client = Arc::clone(&self.client);
            let rg = resource_group.clone();
            let vm_name = resource
                .instance_id
                .clone()
                .unwrap_or_else(|| resource.name.clone());
            let result = with_retries(&self.config.retry, "vm delete", || {
                let client = Arc::clone(&client);
                let rg = rg.clone();
                let vm_name = vm_name.clone();
                async move { client.delete_vm(&rg, &vm_name).await.map_err(CloudError::from) }
            })
            .await;
            match result {
                Ok(()) => {}
                Err(CloudError::NotFound(_)) => {
                    tracing::debug!("VM {vm_name} already gone during downscale");
                }
                Err(e) => return Err(e),
            }
        }

        notifier
            .delete_resources(&context.cloud_context, &to_remove)
            .await?;
        Ok(to_remove
            .into_iter()
            .map(|r| CloudResourceStatus::new(r, ResourceStatus::Deleted))
            .collect())
    }

    async fn collect_resources_to_remove(
        &self,
        _context: &AuthenticatedContext,
        _stack: &CloudStack,
        resources: &[CloudResource],
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudResource>> {
        // Disks and NICs bound to the instances match through their
        // instance id; nothing provider-specific beyond that.
        Ok(deletable_resources(resources, instances))
    }

    async fn terminate(
        &self,
        context: &AuthenticatedContext,
        _stack: &CloudStack,
        resources: &[CloudResource],
        notifier: &dyn PersistenceNotifier,
    ) -> Result<Vec<CloudResourceStatus>> {
        let resource_group = context.stack_name().to_string();
        tracing::info!("terminating stack {resource_group}");

        let client = Arc::clone(&self.client);
        let rg = resource_group.clone();
        let result = with_retries(&self.config.retry, "group delete", || {
            let client = Arc::clone(&client);
            let rg = rg.clone();
            async move { client.delete_resource_group(&rg).await.map_err(CloudError::from) }
        })
        .await;
        match result {
            Ok(()) => {}
            Err(CloudError::NotFound(_)) => {
                tracing::debug!("resource group {resource_group} already gone");
            }
            Err(e) => return Err(e),
        }

        notifier
            .delete_resources(&context.cloud_context, resources)
            .await?;
        Ok(resources
            .iter()
            .cloned()
            .map(|r| CloudResourceStatus::new(r, ResourceStatus::Deleted))
            .collect())
    }

    async fn update(
        &self,
        context: &AuthenticatedContext,
        stack: &CloudStack,
        resources: &[CloudResource],
    ) -> Result<Vec<CloudResourceStatus>> {
        // Re-running the deployment applies template changes in place.
        self.upscale(context, stack, resources).await
    }

    async fn update_load_balancers(
        &self,
        context: &AuthenticatedContext,
        _stack: &CloudStack,
        notifier: &dyn PersistenceNotifier,
    ) -> Result<Vec<CloudResourceStatus>> {
        let stack_name = context.stack_name().to_string();
        let resources = self.collect_deployment_resources(&stack_name, &stack_name).await?;
        let load_balancers: Vec<CloudResource> = resources
            .into_iter()
            .filter(|r| r.resource_type == ResourceType::AzureLoadBalancer)
            .collect();
        if load_balancers.is_empty() {
            return Ok(Vec::new());
        }
        notifier
            .save_resources(&context.cloud_context, &load_balancers)
            .await?;
        Ok(load_balancers
            .into_iter()
            .map(|r| CloudResourceStatus::new(r, ResourceStatus::Created))
            .collect())
    }

    async fn launch_database_server(
        &self,
        context: &AuthenticatedContext,
        stack: &DatabaseStack,
        notifier: &dyn PersistenceNotifier,
    ) -> Result<Vec<CloudResourceStatus>> {
        if !stack.engine.eq_ignore_ascii_case("postgres") {
            return Err(CloudError::NotSupported(format!(
                "database engine {} is not available on Azure, only postgres",
                stack.engine
            )));
        }
        let resource_group = context.stack_name().to_string();
        let server_name = stack.server_name.clone();
        tracing::info!("launching database server {server_name} in {resource_group}");

        let client = Arc::clone(&self.client);
        let rg = resource_group.clone();
        let name = server_name.clone();
        let existing = with_retries(&self.config.retry, "flexible-server show", || {
            let client = Arc::clone(&client);
            let rg = rg.clone();
            let name = name.clone();
            async move {
                client
                    .get_database_server(&rg, &name)
                    .await
                    .map_err(CloudError::from)
            }
        })
        .await?;

        if existing.is_some() {
            tracing::info!("database server {server_name} already exists, reusing it");
        } else {
            let client = Arc::clone(&self.client);
            let rg = resource_group.clone();
            let name = server_name.clone();
            with_retries(&self.config.retry, "flexible-server create", || {
                let client = Arc::clone(&client);
                let rg = rg.clone();
                let name = name.clone();
                async move {
                    client
                        .create_database_server(&rg, &name)
                        .await
                        .map_err(CloudError::from)
                }
            })
            .await?;
        }

        let resource = CloudResource::new(ResourceType::AzureDatabaseServer, &server_name);
        notifier
            .save_resources(&context.cloud_context, std::slice::from_ref(&resource))
            .await?;
        Ok(vec![CloudResourceStatus::new(
            resource,
            ResourceStatus::Created,
        )])
    }

    async fn terminate_database_server(
        &self,
        context: &AuthenticatedContext,
        stack: &DatabaseStack,
        resources: &[CloudResource],
        notifier: &dyn PersistenceNotifier,
        force: bool,
    ) -> Result<Vec<CloudResourceStatus>> {
        let resource_group = context.stack_name().to_string();
        let server_name = stack.server_name.clone();
        tracing::info!("terminating database server {server_name} (force: {force})");

        let client = Arc::clone(&self.client);
        let rg = resource_group.clone();
        let name = server_name.clone();
        let result = with_retries(&self.config.retry, "flexible-server delete", || {
            let client = Arc::clone(&client);
            let rg = rg.clone();
            let name = name.clone();
            async move {
                client
                    .delete_database_server(&rg, &name)
                    .await
                    .map_err(CloudError::from)
            }
        })
        .await;
        match result {
            Ok(()) => {}
            Err(CloudError::NotFound(_)) => {
                tracing::debug!("database server {server_name} already gone");
            }
            Err(e) if force => {
                tracing::warn!("removing database server records despite delete failure: {e}");
            }
            Err(e) => return Err(e),
        }

        notifier
            .delete_resources(&context.cloud_context, resources)
            .await?;
        Ok(resources
            .iter()
            .cloned()
            .map(|r| CloudResourceStatus::new(r, ResourceStatus::Deleted))
            .collect())
    }

    async fn database_server_status(
        &self,
        context: &AuthenticatedContext,
        stack: &DatabaseStack,
    ) -> Result<ExternalDatabaseStatus> {
        let resource_group = context.stack_name().to_string();
        let server_name = stack.server_name.clone();
        let client = Arc::clone(&self.client);
        let server = with_retries(&self.config.retry, "flexible-server show", || {
            let client = Arc::clone(&client);
            let rg = resource_group.clone();
            let name = server_name.clone();
            async move {
                client
                    .get_database_server(&rg, &name)
                    .await
                    .map_err(CloudError::from)
            }
        })
        .await?;
        Ok(match server {
            Some(server) => status::database_status(&server.state),
            None => ExternalDatabaseStatus::Deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ArmDeployment, DbServer, VmView};
    use crate::error::AzureError;
    use stackflow_cloud::context::{CloudContext, Location};
    use stackflow_cloud::notifier::InMemoryNotifier;
    use stackflow_cloud::{PollerConfig, RetryConfig};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct MockArm {
        deployment: Mutex<Option<ArmDeployment>>,
        deployment_resources: Mutex<Vec<ArmResourceRef>>,
        create_deployment_calls: AtomicU32,
        fail_deployment: bool,
        group_exists: Mutex<bool>,
        vms: Mutex<HashMap<String, String>>,
        start_calls: AtomicU32,
        deallocate_calls: AtomicU32,
        delete_vm_calls: AtomicU32,
        db_server: Mutex<Option<DbServer>>,
        db_create_calls: AtomicU32,
        fail_db_delete: bool,
    }

    impl MockArm {
        fn with_vms(states: &[(&str, &str)]) -> Self {
            let mock = Self::default();
            {
                let mut vms = mock.vms.lock().unwrap();
                for (name, power) in states {
                    vms.insert(name.to_string(), power.to_string());
                }
            }
            mock
        }
    }

    #[async_trait]
    impl ArmApi for MockArm {
        async fn get_deployment(
            &self,
            _resource_group: &str,
            _deployment: &str,
        ) -> crate::error::Result<Option<ArmDeployment>> {
            Ok(self.deployment.lock().unwrap().clone())
        }

        async fn create_deployment(
            &self,
            _resource_group: &str,
            deployment: &str,
            _template_body: &str,
        ) -> crate::error::Result<()> {
            self.create_deployment_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_deployment {
                return Err(AzureError::Api("deployment failed".into()));
            }
            *self.deployment.lock().unwrap() = Some(ArmDeployment {
                name: deployment.to_string(),
                provisioning_state: "Succeeded".to_string(),
            });
            *self.group_exists.lock().unwrap() = true;
            Ok(())
        }

        async fn list_deployment_resources(
            &self,
            _resource_group: &str,
            _deployment: &str,
        ) -> crate::error::Result<Vec<ArmResourceRef>> {
            Ok(self.deployment_resources.lock().unwrap().clone())
        }

        async fn delete_resource_group(&self, resource_group: &str) -> crate::error::Result<()> {
            let mut exists = self.group_exists.lock().unwrap();
            if !*exists {
                return Err(AzureError::NotFound(format!(
                    "ResourceGroupNotFound: {resource_group}"
                )));
            }
            *exists = false;
            *self.deployment.lock().unwrap() = None;
            Ok(())
        }

        async fn get_vm_view(
            &self,
            _resource_group: &str,
            vm_name: &str,
        ) -> crate::error::Result<Option<VmView>> {
            Ok(self.vms.lock().unwrap().get(vm_name).map(|power| VmView {
                name: vm_name.to_string(),
                power_state: power.clone(),
                provisioning_state: "Succeeded".to_string(),
            }))
        }

        async fn start_vm(&self, _resource_group: &str, vm_name: &str) -> crate::error::Result<()> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            self.vms
                .lock()
                .unwrap()
                .insert(vm_name.to_string(), "running".to_string());
            Ok(())
        }

        async fn deallocate_vm(
            &self,
            _resource_group: &str,
            vm_name: &str,
        ) -> crate::error::Result<()> {
            self.deallocate_calls.fetch_add(1, Ordering::SeqCst);
            self.vms
                .lock()
                .unwrap()
                .insert(vm_name.to_string(), "deallocated".to_string());
            Ok(())
        }

        async fn delete_vm(&self, _resource_group: &str, vm_name: &str) -> crate::error::Result<()> {
            self.delete_vm_calls.fetch_add(1, Ordering::SeqCst);
            if self.vms.lock().unwrap().remove(vm_name).is_none() {
                return Err(AzureError::NotFound(format!("ResourceNotFound: {vm_name}")));
            }
            Ok(())
        }

        async fn create_database_server(
            &self,
            _resource_group: &str,
            server_name: &str,
        ) -> crate::error::Result<()> {
            self.db_create_calls.fetch_add(1, Ordering::SeqCst);
            *self.db_server.lock().unwrap() = Some(DbServer {
                name: server_name.to_string(),
                state: "Ready".to_string(),
            });
            Ok(())
        }

        async fn get_database_server(
            &self,
            _resource_group: &str,
            _server_name: &str,
        ) -> crate::error::Result<Option<DbServer>> {
            Ok(self.db_server.lock().unwrap().clone())
        }

        async fn delete_database_server(
            &self,
            _resource_group: &str,
            server_name: &str,
        ) -> crate::error::Result<()> {
            if self.fail_db_delete {
                return Err(AzureError::Api("delete blocked by lock".into()));
            }
            let mut server = self.db_server.lock().unwrap();
            if server.is_none() {
                return Err(AzureError::NotFound(format!(
                    "ResourceNotFound: {server_name}"
                )));
            }
            *server = None;
            Ok(())
        }
    }

    fn fast_config() -> ConnectorConfig {
        ConnectorConfig {
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                multiplier: 2.0,
            },
            poller: PollerConfig {
                interval_ms: 1,
                max_wait_ms: 200,
            },
        }
    }

    fn context() -> AuthenticatedContext {
        AuthenticatedContext::new(CloudContext::new(
            2,
            "demo-stack",
            Platform::Azure,
            Location::new("westeurope"),
        ))
    }

    fn instance(name: &str) -> CloudInstance {
        CloudInstance::new(Some(name.to_string()), "worker")
    }

    fn vm_ref(name: &str) -> ArmResourceRef {
        ArmResourceRef {
            id: format!(
                "/subscriptions/s/resourceGroups/demo-stack/providers/Microsoft.Compute/virtualMachines/{name}"
            ),
        }
    }

    #[tokio::test]
    async fn launch_reuses_an_existing_deployment() {
        let mock = Arc::new(MockArm::default());
        *mock.deployment.lock().unwrap() = Some(ArmDeployment {
            name: "demo-stack".to_string(),
            provisioning_state: "Succeeded".to_string(),
        });
        *mock.deployment_resources.lock().unwrap() = vec![vm_ref("vm-1")];
        let connector = AzureConnector::new(mock.clone(), fast_config());
        let notifier = InMemoryNotifier::new();
        let stack = CloudStack::new(vec![stackflow_cloud::InstanceGroup::new(
            "worker",
            vec![instance("vm-1")],
        )])
        .with_template("{}");

        let first = connector
            .launch(&context(), &stack, &notifier, AdjustmentType::BestEffort, 0)
            .await
            .unwrap();
        let second = connector
            .launch(&context(), &stack, &notifier, AdjustmentType::BestEffort, 0)
            .await
            .unwrap();

        assert_eq!(mock.create_deployment_calls.load(Ordering::SeqCst), 0);
        assert_eq!(first, second);
        assert_eq!(first[0].status, ResourceStatus::Created);
        // One deployment record plus one instance record, no duplicates.
        assert_eq!(notifier.resources_for(&context().cloud_context).len(), 2);
    }

    #[tokio::test]
    async fn launch_persists_discovered_resources_on_the_failure_path() {
        let mock = Arc::new(MockArm {
            fail_deployment: true,
            ..MockArm::default()
        });
        *mock.deployment_resources.lock().unwrap() = vec![vm_ref("vm-1")];
        let connector = AzureConnector::new(mock, fast_config());
        let notifier = InMemoryNotifier::new();
        let stack = CloudStack::new(Vec::new()).with_template("{}");

        let result = connector
            .launch(&context(), &stack, &notifier, AdjustmentType::BestEffort, 0)
            .await;

        assert!(result.is_err());
        assert!(!notifier.resources_for(&context().cloud_context).is_empty());
    }

    #[tokio::test]
    async fn check_reports_missing_deployment_as_deleted() {
        let connector = AzureConnector::new(Arc::new(MockArm::default()), fast_config());
        let resource = CloudResource::new(ResourceType::AzureTemplateDeployment, "demo-stack");

        let statuses = connector.check(&context(), &[resource]).await.unwrap();

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, ResourceStatus::Deleted);
    }

    #[tokio::test]
    async fn check_rejects_foreign_resource_types() {
        let connector = AzureConnector::new(Arc::new(MockArm::default()), fast_config());
        let foreign = CloudResource::new(ResourceType::AwsInstance, "i-1");

        let result = connector.check(&context(), &[foreign]).await;

        assert!(matches!(result, Err(CloudError::Rejected(_))));
    }

    #[tokio::test]
    async fn stop_skips_vms_already_deallocated() {
        let mock = Arc::new(MockArm::with_vms(&[("vm-1", "running"), ("vm-2", "deallocated")]));
        let connector = AzureConnector::new(mock.clone(), fast_config());

        let statuses = connector
            .stop(&context(), &[], &[instance("vm-1"), instance("vm-2")])
            .await
            .unwrap();

        assert_eq!(mock.deallocate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.status == InstanceStatus::Stopped));
    }

    #[tokio::test]
    async fn reboot_cycles_only_running_vms() {
        let mock = Arc::new(MockArm::with_vms(&[("vm-a", "running"), ("vm-b", "deallocated")]));
        let connector = AzureConnector::new(mock.clone(), fast_config());

        let statuses = connector
            .reboot(&context(), &[instance("vm-a"), instance("vm-b")])
            .await
            .unwrap();

        assert_eq!(mock.deallocate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].instance.instance_id(), Some("vm-a"));
        assert_eq!(statuses[0].status, InstanceStatus::Started);
        assert_eq!(mock.vms.lock().unwrap()["vm-b"], "deallocated");
    }

    #[tokio::test]
    async fn check_instances_drops_missing_vm_without_failing() {
        let mock = Arc::new(MockArm::with_vms(&[("vm-1", "running")]));
        let connector = AzureConnector::new(mock, fast_config());

        let statuses = connector
            .check_instances(&context(), &[instance("vm-1"), instance("vm-2")])
            .await
            .unwrap();

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].instance.instance_id(), Some("vm-1"));
    }

    #[tokio::test]
    async fn terminate_tolerates_a_missing_resource_group() {
        let connector = AzureConnector::new(Arc::new(MockArm::default()), fast_config());
        let notifier = InMemoryNotifier::new();
        let resources = vec![CloudResource::new(
            ResourceType::AzureTemplateDeployment,
            "demo-stack",
        )];
        notifier
            .save_resources(&context().cloud_context, &resources)
            .await
            .unwrap();

        let statuses = connector
            .terminate(&context(), &CloudStack::default(), &resources, &notifier)
            .await
            .unwrap();

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, ResourceStatus::Deleted);
        assert!(notifier.resources_for(&context().cloud_context).is_empty());
    }

    #[tokio::test]
    async fn downscale_deletes_exactly_the_computed_subset() {
        let mock = Arc::new(MockArm::with_vms(&[("vm-1", "running"), ("vm-2", "running")]));
        let connector = AzureConnector::new(mock.clone(), fast_config());
        let notifier = InMemoryNotifier::new();
        let resources = vec![
            CloudResource::new(ResourceType::AzureInstance, "vm-1").with_instance_id("vm-1"),
            CloudResource::new(ResourceType::AzureInstance, "vm-2").with_instance_id("vm-2"),
            CloudResource::new(ResourceType::AzureManagedDisk, "disk-2").with_instance_id("vm-2"),
        ];
        notifier
            .save_resources(&context().cloud_context, &resources)
            .await
            .unwrap();

        let to_remove = connector
            .collect_resources_to_remove(
                &context(),
                &CloudStack::default(),
                &resources,
                &[instance("vm-2")],
            )
            .await
            .unwrap();
        let statuses = connector
            .downscale(
                &context(),
                &CloudStack::default(),
                &resources,
                &[instance("vm-2")],
                to_remove,
                &notifier,
            )
            .await
            .unwrap();

        // The VM and its bound disk were selected; only the VM is deleted
        // on the provider, both records are dropped.
        assert_eq!(statuses.len(), 2);
        assert!(mock.vms.lock().unwrap().contains_key("vm-1"));
        assert!(!mock.vms.lock().unwrap().contains_key("vm-2"));
        assert_eq!(notifier.resources_for(&context().cloud_context).len(), 1);
    }

    #[tokio::test]
    async fn database_server_launch_is_idempotent() {
        let mock = Arc::new(MockArm::default());
        let connector = AzureConnector::new(mock.clone(), fast_config());
        let notifier = InMemoryNotifier::new();
        let db = DatabaseStack::new("db-1", "postgres");

        connector
            .launch_database_server(&context(), &db, &notifier)
            .await
            .unwrap();
        connector
            .launch_database_server(&context(), &db, &notifier)
            .await
            .unwrap();

        assert_eq!(mock.db_create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.resources_for(&context().cloud_context).len(), 1);
        assert_eq!(
            connector.database_server_status(&context(), &db).await.unwrap(),
            ExternalDatabaseStatus::Started
        );
    }

    #[tokio::test]
    async fn unsupported_database_engine_is_rejected() {
        let connector = AzureConnector::new(Arc::new(MockArm::default()), fast_config());
        let notifier = InMemoryNotifier::new();
        let db = DatabaseStack::new("db-1", "oracle");

        let result = connector
            .launch_database_server(&context(), &db, &notifier)
            .await;

        assert!(matches!(result, Err(CloudError::NotSupported(_))));
    }

    #[tokio::test]
    async fn missing_database_server_reports_deleted() {
        let connector = AzureConnector::new(Arc::new(MockArm::default()), fast_config());
        let db = DatabaseStack::new("db-1", "postgres");

        let status = connector
            .database_server_status(&context(), &db)
            .await
            .unwrap();

        assert_eq!(status, ExternalDatabaseStatus::Deleted);
    }

    #[tokio::test]
    async fn force_termination_drops_records_despite_delete_failure() {
        let mock = Arc::new(MockArm {
            fail_db_delete: true,
            ..MockArm::default()
        });
        *mock.db_server.lock().unwrap() = Some(DbServer {
            name: "db-1".to_string(),
            state: "Ready".to_string(),
        });
        let connector = AzureConnector::new(mock, fast_config());
        let notifier = InMemoryNotifier::new();
        let db = DatabaseStack::new("db-1", "postgres");
        let resources = vec![CloudResource::new(ResourceType::AzureDatabaseServer, "db-1")];
        notifier
            .save_resources(&context().cloud_context, &resources)
            .await
            .unwrap();

        let without_force = connector
            .terminate_database_server(&context(), &db, &resources, &notifier, false)
            .await;
        assert!(without_force.is_err());
        assert_eq!(notifier.resources_for(&context().cloud_context).len(), 1);

        let with_force = connector
            .terminate_database_server(&context(), &db, &resources, &notifier, true)
            .await
            .unwrap();
        assert_eq!(with_force.len(), 1);
        assert_eq!(with_force[0].status, ResourceStatus::Deleted);
        assert!(notifier.resources_for(&context().cloud_context).is_empty());
    }
}
