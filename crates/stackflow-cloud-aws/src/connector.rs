//! AWS connector implementation
//!
//! Instances are managed through EC2 power operations, the stack itself
//! through a CloudFormation template deployment. All provider calls go
//! through the retry wrapper; asynchronous mutations hand off to the
//! convergence poller.

use crate::client::{AwsCli, CfnResourceSummary, Ec2Api, Ec2Instance};
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

const EC2_RUNNING: &str = "running";
const EC2_STOPPED: &str = "stopped";

/// AWS implementation of the uniform lifecycle protocol.
pub struct AwsConnector {
    client: Arc<dyn Ec2Api>,
    config: ConnectorConfig,
}

impl AwsConnector {
    pub fn new(client: Arc<dyn Ec2Api>, config: ConnectorConfig) -> Self {
        Self { client, config }
    }

    /// Connector backed by the `aws` CLI for the given region.
    pub fn from_cli(region: impl Into<String>, config: ConnectorConfig) -> Self {
        Self::new(Arc::new(AwsCli::new(region)), config)
    }

    fn with_ids(instances: &[CloudInstance]) -> Vec<CloudInstance> {
        instances
            .iter()
            .filter(|i| i.instance_id().is_some())
            .cloned()
            .collect()
    }

    /// Describe the given instances, dropping from the working set any
    /// instance the provider reports as gone instead of failing the batch.
    async fn describe_existing(
        &self,
        vms: &mut Vec<CloudInstance>,
    ) -> Result<Vec<Ec2Instance>> {
        loop {
            let ids: Vec<String> = vms
                .iter()
                .filter_map(|v| v.instance_id().map(String::from))
                .collect();
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let client = Arc::clone(&self.client);
            let result = with_retries(&self.config.retry, "ec2 describe-instances", || {
                let client = Arc::clone(&client);
                let ids = ids.clone();
                async move { client.describe_instances(&ids).await.map_err(CloudError::from) }
            })
            .await;
            match result {
                Ok(described) => return Ok(described),
                Err(CloudError::NotFound(id)) => {
                    // An id matching nothing tracked cannot shrink the set;
                    // re-issuing the same call would never terminate.
                    let before = vms.len();
                    vms.retain(|v| v.instance_id() != Some(id.as_str()));
                    if vms.len() == before {
                        return Err(CloudError::NotFound(id));
                    }
                    tracing::warn!("instance {id} no longer exists, removing from working set");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn vm_statuses(&self, mut vms: Vec<CloudInstance>) -> Result<Vec<CloudVmInstanceStatus>> {
        let described = self.describe_existing(&mut vms).await?;
        let mut statuses = Vec::new();
        for vm in &vms {
            let Some(found) = described
                .iter()
                .find(|d| Some(d.instance_id.as_str()) == vm.instance_id())
            else {
                continue;
            };
            tracing::debug!("instance {} is '{}' on provider side", found.instance_id, found.state);
            let mut entry = CloudVmInstanceStatus::new(
                vm.clone(),
                status::instance_status(&found.state, found.state_reason_code.as_deref()),
            );
            if let Some(message) = &found.state_reason_message {
                entry = entry.with_reason(message.clone());
            }
            statuses.push(entry);
        }
        Ok(statuses)
    }

    /// Drive instances toward the given native power state: mutate only the
    /// ones not already there, then wait for convergence.
    async fn set_power_state(
        &self,
        instances: &[CloudInstance],
        target_native: &str,
    ) -> Result<Vec<CloudVmInstanceStatus>> {
        let mut vms = Self::with_ids(instances);
        if vms.is_empty() {
            return Ok(Vec::new());
        }

        let described = self.describe_existing(&mut vms).await?;
        let mut pending: Vec<String> = described
            .iter()
            .filter(|d| !d.state.eq_ignore_ascii_case(target_native))
            .map(|d| d.instance_id.clone())
            .collect();

        let operation = if target_native.eq_ignore_ascii_case(EC2_RUNNING) {
            "ec2 start-instances"
        } else {
            "ec2 stop-instances"
        };

        if pending.is_empty() {
            tracing::debug!("all instances already '{target_native}', no mutation needed");
        }
        while !pending.is_empty() {
            let client = Arc::clone(&self.client);
            let ids = pending.clone();
            let start = target_native.eq_ignore_ascii_case(EC2_RUNNING);
            let result = with_retries(&self.config.retry, operation, || {
                let client = Arc::clone(&client);
                let ids = ids.clone();
                async move {
                    if start {
                        client.start_instances(&ids).await.map_err(CloudError::from)
                    } else {
                        client.stop_instances(&ids).await.map_err(CloudError::from)
                    }
                }
            })
            .await;
            match result {
                Ok(()) => break,
                Err(CloudError::NotFound(id)) => {
                    let before = pending.len();
                    pending.retain(|p| p != &id);
                    vms.retain(|v| v.instance_id() != Some(id.as_str()));
                    if pending.len() == before {
                        return Err(CloudError::NotFound(id));
                    }
                    tracing::warn!("instance {id} disappeared before {operation}, dropping it");
                }
                Err(e) => return Err(e),
            }
        }

        let targets: HashSet<InstanceStatus> =
            [status::target_status(target_native)].into_iter().collect();
        let poll = wait_for_statuses(&self.config.poller, vms, &targets, None, |batch| async move {
            self.vm_statuses(batch).await
        })
        .await?;
        Ok(poll.statuses)
    }

    async fn describe_stack_with_retries(&self, stack_name: &str) -> Result<Option<crate::client::CfnStack>> {
        let client = Arc::clone(&self.client);
        let name = stack_name.to_string();
        with_retries(&self.config.retry, "cloudformation describe-stacks", || {
            let client = Arc::clone(&client);
            let name = name.clone();
            async move { client.describe_stack(&name).await.map_err(CloudError::from) }
        })
        .await
    }

    async fn collect_stack_resources(&self, stack_name: &str) -> Result<Vec<CloudResource>> {
        let client = Arc::clone(&self.client);
        let name = stack_name.to_string();
        let summaries = with_retries(&self.config.retry, "cloudformation list-stack-resources", || {
            let client = Arc::clone(&client);
            let name = name.clone();
            async move { client.list_stack_resources(&name).await.map_err(CloudError::from) }
        })
        .await?;

        let mut resources = vec![CloudResource::new(
            ResourceType::AwsCloudFormationStack,
            stack_name,
        )];
        for summary in summaries {
            if let Some(resource) = cloud_resource_from_summary(&summary) {
                resources.push(resource);
            } else {
                tracing::debug!(
                    "ignoring untracked CloudFormation resource type {}",
                    summary.resource_type
                );
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
        // Delete-then-save keeps the gateway idempotent across partial
        // prior executions.
        notifier
            .delete_resources(&context.cloud_context, resources)
            .await?;
        notifier
            .save_resources(&context.cloud_context, resources)
            .await?;
        tracing::info!("persisted {} resource(s) for stack {}", resources.len(), context.stack_name());
        Ok(())
    }
}

fn cloud_resource_from_summary(summary: &CfnResourceSummary) -> Option<CloudResource> {
    let resource_type = match summary.resource_type.as_str() {
        "AWS::EC2::Instance" => ResourceType::AwsInstance,
        "AWS::EC2::Volume" => ResourceType::AwsVolume,
        "AWS::EC2::VPC" | "AWS::EC2::Subnet" | "AWS::EC2::SecurityGroup" => ResourceType::AwsNetwork,
        "AWS::ElasticLoadBalancingV2::LoadBalancer" => ResourceType::AwsLoadBalancer,
        _ => return None,
    };
    let name = if summary.physical_id.is_empty() {
        summary.logical_id.clone()
    } else {
        summary.physical_id.clone()
    };
    let mut resource = CloudResource::new(resource_type, name);
    if resource_type == ResourceType::AwsInstance && !summary.physical_id.is_empty() {
        resource = resource.with_instance_id(summary.physical_id.clone());
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
                "instance {} has status {}",
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
impl CloudConnector for AwsConnector {
    fn platform(&self) -> Platform {
        Platform::Aws
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
            CloudError::Rejected(format!("stack {stack_name} has no CloudFormation template"))
        })?;
        tracing::info!(
            "launching stack {stack_name} ({:?}, threshold {threshold})",
            adjustment
        );

        let mut persisted = false;
        let launch_result: Result<()> = async {
            let existing = self.describe_stack_with_retries(&stack_name).await?;
            if existing.is_some() {
                tracing::info!("CloudFormation stack {stack_name} already exists, reusing it");
            } else {
                let client = Arc::clone(&self.client);
                let name = stack_name.clone();
                let body = template.clone();
                with_retries(&self.config.retry, "cloudformation create-stack", || {
                    let client = Arc::clone(&client);
                    let name = name.clone();
                    let body = body.clone();
                    async move { client.create_stack(&name, &body).await.map_err(CloudError::from) }
                })
                .await?;
            }

            let resources = self.collect_stack_resources(&stack_name).await?;
            self.persist_discovered(context, notifier, &resources).await?;
            persisted = true;

            let created = resources
                .iter()
                .filter(|r| r.resource_type == ResourceType::AwsInstance)
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
            match self.collect_stack_resources(&stack_name).await {
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
            CloudResource::new(ResourceType::AwsCloudFormationStack, &stack_name);
        let statuses = self.check(context, &[template_resource]).await?;
        tracing::debug!("launched resources: {statuses:?}");
        Ok(statuses)
    }

    async fn check(
        &self,
        _context: &AuthenticatedContext,
        resources: &[CloudResource],
    ) -> Result<Vec<CloudResourceStatus>> {
        let mut result = Vec::new();
        for resource in resources {
            match resource.resource_type {
                ResourceType::AwsCloudFormationStack => {
                    match self.describe_stack_with_retries(&resource.name).await {
                        Ok(Some(stack)) => {
                            result.push(
                                CloudResourceStatus::new(
                                    resource.clone(),
                                    status::resource_status(&stack.status),
                                )
                                .with_reason(stack.status),
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
                other if other.platform() == Platform::Aws => {
                    // Tracked through the CloudFormation stack; no
                    // standalone status to report.
                }
                other => {
                    return Err(CloudError::Rejected(format!(
                        "invalid resource type for the AWS connector: {other}"
                    )));
                }
            }
        }
        Ok(result)
    }

    async fn check_instances(
        &self,
        _context: &AuthenticatedContext,
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudVmInstanceStatus>> {
        let vms = Self::with_ids(instances);
        tracing::debug!("checking {} instance(s) on provider side", vms.len());
        if vms.is_empty() {
            return Ok(Vec::new());
        }
        self.vm_statuses(vms).await
    }

    async fn start(
        &self,
        _context: &AuthenticatedContext,
        _resources: &[CloudResource],
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudVmInstanceStatus>> {
        self.set_power_state(instances, EC2_RUNNING).await
    }

    async fn stop(
        &self,
        _context: &AuthenticatedContext,
        _resources: &[CloudResource],
        instances: &[CloudInstance],
    ) -> Result<Vec<CloudVmInstanceStatus>> {
        self.set_power_state(instances, EC2_STOPPED).await
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
                    "unable to stop instance {} for reboot: {e}",
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
                        "unable to start instance {} after reboot stop: {e}",
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
            CloudError::Rejected(format!("stack {stack_name} has no CloudFormation template"))
        })?;
        tracing::info!("upscaling stack {stack_name}");

        let client = Arc::clone(&self.client);
        let name = stack_name.clone();
        with_retries(&self.config.retry, "cloudformation update-stack", || {
            let client = Arc::clone(&client);
            let name = name.clone();
            let body = template.clone();
            async move { client.update_stack(&name, &body).await.map_err(CloudError::from) }
        })
        .await?;

        let template_resource =
            CloudResource::new(ResourceType::AwsCloudFormationStack, &stack_name);
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
        let mut ids: Vec<String> = to_remove
            .iter()
            .filter(|r| r.resource_type == ResourceType::AwsInstance)
            .map(|r| r.instance_id.clone().unwrap_or_else(|| r.name.clone()))
            .collect();

        while !ids.is_empty() {
            let client = Arc::clone(&self.client);
            let batch = ids.clone();
            let result = with_retries(&self.config.retry, "ec2 terminate-instances", || {
                let client = Arc::clone(&client);
                let batch = batch.clone();
                async move { client.terminate_instances(&batch).await.map_err(CloudError::from) }
            })
            .await;
            match result {
                Ok(()) => break,
                Err(CloudError::NotFound(id)) => {
                    let before = ids.len();
                    ids.retain(|i| i != &id);
                    if ids.len() == before {
                        return Err(CloudError::NotFound(id));
                    }
                    tracing::debug!("instance {id} already gone during downscale");
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
        // No provider-specific dependents beyond the instance-bound set.
        Ok(deletable_resources(resources, instances))
    }

    async fn terminate(
        &self,
        context: &AuthenticatedContext,
        _stack: &CloudStack,
        resources: &[CloudResource],
        notifier: &dyn PersistenceNotifier,
    ) -> Result<Vec<CloudResourceStatus>> {
        let stack_name = context.stack_name().to_string();
        tracing::info!("terminating stack {stack_name}");

        let client = Arc::clone(&self.client);
        let name = stack_name.clone();
        let result = with_retries(&self.config.retry, "cloudformation delete-stack", || {
            let client = Arc::clone(&client);
            let name = name.clone();
            async move { client.delete_stack(&name).await.map_err(CloudError::from) }
        })
        .await;
        match result {
            Ok(()) => {}
            Err(CloudError::NotFound(_)) => {
                tracing::debug!("CloudFormation stack {stack_name} already gone");
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
        _resources: &[CloudResource],
    ) -> Result<Vec<CloudResourceStatus>> {
        let stack_name = context.stack_name().to_string();
        let template = stack.template.clone().ok_or_else(|| {
            CloudError::Rejected(format!("stack {stack_name} has no CloudFormation template"))
        })?;

        let client = Arc::clone(&self.client);
        let name = stack_name.clone();
        let result = with_retries(&self.config.retry, "cloudformation update-stack", || {
            let client = Arc::clone(&client);
            let name = name.clone();
            let body = template.clone();
            async move { client.update_stack(&name, &body).await.map_err(CloudError::from) }
        })
        .await;
        match result {
            Ok(()) => {}
            // CloudFormation rejects a no-change update; the desired state
            // already holds.
            Err(CloudError::Rejected(message)) if message.contains("No updates") => {
                tracing::debug!("stack {stack_name} is already up to date");
            }
            Err(e) => return Err(e),
        }

        let template_resource =
            CloudResource::new(ResourceType::AwsCloudFormationStack, &stack_name);
        self.check(context, &[template_resource]).await
    }

    async fn update_load_balancers(
        &self,
        context: &AuthenticatedContext,
        _stack: &CloudStack,
        notifier: &dyn PersistenceNotifier,
    ) -> Result<Vec<CloudResourceStatus>> {
        let stack_name = context.stack_name().to_string();
        let resources = self.collect_stack_resources(&stack_name).await?;
        let load_balancers: Vec<CloudResource> = resources
            .into_iter()
            .filter(|r| r.resource_type == ResourceType::AwsLoadBalancer)
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
        _context: &AuthenticatedContext,
        _stack: &DatabaseStack,
        _notifier: &dyn PersistenceNotifier,
    ) -> Result<Vec<CloudResourceStatus>> {
        Err(CloudError::NotSupported(
            "managed database servers are not available on the AWS connector".into(),
        ))
    }

    async fn terminate_database_server(
        &self,
        _context: &AuthenticatedContext,
        _stack: &DatabaseStack,
        _resources: &[CloudResource],
        _notifier: &dyn PersistenceNotifier,
        _force: bool,
    ) -> Result<Vec<CloudResourceStatus>> {
        Err(CloudError::NotSupported(
            "managed database servers are not available on the AWS connector".into(),
        ))
    }

    async fn database_server_status(
        &self,
        _context: &AuthenticatedContext,
        _stack: &DatabaseStack,
    ) -> Result<ExternalDatabaseStatus> {
        Err(CloudError::NotSupported(
            "managed database servers are not available on the AWS connector".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CfnStack;
    use crate::error::AwsError;
    use stackflow_cloud::context::{CloudContext, Location};
    use stackflow_cloud::notifier::InMemoryNotifier;
    use stackflow_cloud::{PollerConfig, RetryConfig};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct MockEc2 {
        instances: Mutex<HashMap<String, String>>,
        describe_calls: AtomicU32,
        start_calls: AtomicU32,
        stop_calls: AtomicU32,
        terminate_calls: AtomicU32,
        stack: Mutex<Option<CfnStack>>,
        stack_resources: Mutex<Vec<CfnResourceSummary>>,
        create_calls: AtomicU32,
        fail_create: bool,
        // Answer describe/terminate with a not-found whose id matches no
        // tracked instance, the way a garbled provider message parses.
        misreport_describe: bool,
        misreport_terminate: bool,
    }

    impl MockEc2 {
        fn with_instances(states: &[(&str, &str)]) -> Self {
            let mock = Self::default();
            {
                let mut instances = mock.instances.lock().unwrap();
                for (id, state) in states {
                    instances.insert(id.to_string(), state.to_string());
                }
            }
            mock
        }
    }

    #[async_trait]
    impl Ec2Api for MockEc2 {
        async fn describe_instances(
            &self,
            instance_ids: &[String],
        ) -> crate::error::Result<Vec<Ec2Instance>> {
            self.describe_calls.fetch_add(1, Ordering::SeqCst);
            if self.misreport_describe {
                return Err(AwsError::InstanceNotFound {
                    instance_id: "unknown".to_string(),
                });
            }
            let instances = self.instances.lock().unwrap();
            for id in instance_ids {
                if !instances.contains_key(id) {
                    return Err(AwsError::InstanceNotFound {
                        instance_id: id.clone(),
                    });
                }
            }
            Ok(instance_ids
                .iter()
                .map(|id| Ec2Instance {
                    instance_id: id.clone(),
                    state: instances[id].clone(),
                    state_reason_code: None,
                    state_reason_message: None,
                })
                .collect())
        }

        async fn start_instances(&self, instance_ids: &[String]) -> crate::error::Result<()> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            let mut instances = self.instances.lock().unwrap();
            for id in instance_ids {
                instances.insert(id.clone(), "running".to_string());
            }
            Ok(())
        }

        async fn stop_instances(&self, instance_ids: &[String]) -> crate::error::Result<()> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            let mut instances = self.instances.lock().unwrap();
            for id in instance_ids {
                instances.insert(id.clone(), "stopped".to_string());
            }
            Ok(())
        }

        async fn terminate_instances(&self, instance_ids: &[String]) -> crate::error::Result<()> {
            self.terminate_calls.fetch_add(1, Ordering::SeqCst);
            if self.misreport_terminate {
                return Err(AwsError::InstanceNotFound {
                    instance_id: "unknown".to_string(),
                });
            }
            let mut instances = self.instances.lock().unwrap();
            for id in instance_ids {
                instances.remove(id);
            }
            Ok(())
        }

        async fn describe_stack(&self, _stack_name: &str) -> crate::error::Result<Option<CfnStack>> {
            Ok(self.stack.lock().unwrap().clone())
        }

        async fn create_stack(
            &self,
            stack_name: &str,
            _template_body: &str,
        ) -> crate::error::Result<()> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_create {
                return Err(AwsError::Api("stack creation failed".into()));
            }
            *self.stack.lock().unwrap() = Some(CfnStack {
                name: stack_name.to_string(),
                status: "CREATE_COMPLETE".to_string(),
            });
            Ok(())
        }

        async fn update_stack(
            &self,
            _stack_name: &str,
            _template_body: &str,
        ) -> crate::error::Result<()> {
            Ok(())
        }

        async fn delete_stack(&self, stack_name: &str) -> crate::error::Result<()> {
            let mut stack = self.stack.lock().unwrap();
            if stack.is_none() {
                return Err(AwsError::StackNotFound(stack_name.to_string()));
            }
            *stack = None;
            Ok(())
        }

        async fn list_stack_resources(
            &self,
            _stack_name: &str,
        ) -> crate::error::Result<Vec<CfnResourceSummary>> {
            Ok(self.stack_resources.lock().unwrap().clone())
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
            1,
            "demo-stack",
            Platform::Aws,
            Location::new("eu-west-1"),
        ))
    }

    fn instance(id: &str) -> CloudInstance {
        CloudInstance::new(Some(id.to_string()), "worker")
    }

    fn instance_summary(id: &str) -> CfnResourceSummary {
        CfnResourceSummary {
            logical_id: format!("node{id}"),
            physical_id: id.to_string(),
            resource_type: "AWS::EC2::Instance".to_string(),
            status: "CREATE_COMPLETE".to_string(),
        }
    }

    #[tokio::test]
    async fn start_skips_instances_already_running() {
        let mock = Arc::new(MockEc2::with_instances(&[("i-1", "running"), ("i-2", "running")]));
        let connector = AwsConnector::new(mock.clone(), fast_config());

        let statuses = connector
            .start(&context(), &[], &[instance("i-1"), instance("i-2")])
            .await
            .unwrap();

        assert_eq!(mock.start_calls.load(Ordering::SeqCst), 0);
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.status == InstanceStatus::Started));
    }

    #[tokio::test]
    async fn stop_mutates_only_instances_not_yet_stopped() {
        let mock = Arc::new(MockEc2::with_instances(&[("i-1", "running"), ("i-2", "stopped")]));
        let connector = AwsConnector::new(mock.clone(), fast_config());

        let statuses = connector
            .stop(&context(), &[], &[instance("i-1"), instance("i-2")])
            .await
            .unwrap();

        assert_eq!(mock.stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.status == InstanceStatus::Stopped));
    }

    #[tokio::test]
    async fn check_instances_drops_missing_instance_without_failing() {
        let mock = Arc::new(MockEc2::with_instances(&[("i-1", "running")]));
        let connector = AwsConnector::new(mock, fast_config());

        let statuses = connector
            .check_instances(&context(), &[instance("i-1"), instance("i-2")])
            .await
            .unwrap();

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].instance.instance_id(), Some("i-1"));
    }

    #[tokio::test]
    async fn check_instances_on_empty_set_contacts_nobody() {
        let mock = Arc::new(MockEc2::default());
        let connector = AwsConnector::new(mock.clone(), fast_config());

        let statuses = connector.check_instances(&context(), &[]).await.unwrap();

        assert!(statuses.is_empty());
        assert_eq!(mock.describe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reboot_cycles_only_started_instances() {
        let mock = Arc::new(MockEc2::with_instances(&[("i-a", "running"), ("i-b", "stopped")]));
        let connector = AwsConnector::new(mock.clone(), fast_config());

        let statuses = connector
            .reboot(&context(), &[instance("i-a"), instance("i-b")])
            .await
            .unwrap();

        // Exactly A was stopped then started; B was left untouched.
        assert_eq!(mock.stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].instance.instance_id(), Some("i-a"));
        assert_eq!(statuses[0].status, InstanceStatus::Started);
        assert_eq!(mock.instances.lock().unwrap()["i-b"], "stopped");
    }

    #[tokio::test]
    async fn launch_reuses_an_existing_stack() {
        let mock = Arc::new(MockEc2::default());
        *mock.stack.lock().unwrap() = Some(CfnStack {
            name: "demo-stack".to_string(),
            status: "CREATE_COMPLETE".to_string(),
        });
        *mock.stack_resources.lock().unwrap() = vec![instance_summary("i-1")];
        let connector = AwsConnector::new(mock.clone(), fast_config());
        let notifier = InMemoryNotifier::new();
        let stack = CloudStack::new(vec![stackflow_cloud::InstanceGroup::new(
            "worker",
            vec![instance("i-1")],
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

        assert_eq!(mock.create_calls.load(Ordering::SeqCst), 0);
        assert_eq!(first, second);
        // One stack record plus one instance record, no duplicates.
        assert_eq!(notifier.resources_for(&context().cloud_context).len(), 2);
    }

    #[tokio::test]
    async fn launch_persists_discovered_resources_on_the_failure_path() {
        let mock = Arc::new(MockEc2 {
            fail_create: true,
            ..MockEc2::default()
        });
        *mock.stack_resources.lock().unwrap() = vec![instance_summary("i-1")];
        let connector = AwsConnector::new(mock, fast_config());
        let notifier = InMemoryNotifier::new();
        let stack = CloudStack::new(Vec::new()).with_template("{}");

        let result = connector
            .launch(&context(), &stack, &notifier, AdjustmentType::BestEffort, 0)
            .await;

        assert!(result.is_err());
        // The partially created resources were still recorded.
        assert!(!notifier.resources_for(&context().cloud_context).is_empty());
    }

    #[tokio::test]
    async fn launch_fails_below_exact_threshold_but_keeps_records() {
        let mock = Arc::new(MockEc2::default());
        *mock.stack_resources.lock().unwrap() = vec![instance_summary("i-1")];
        let connector = AwsConnector::new(mock, fast_config());
        let notifier = InMemoryNotifier::new();
        let stack = CloudStack::new(vec![stackflow_cloud::InstanceGroup::new(
            "worker",
            vec![instance("i-1"), CloudInstance::new(None, "worker")],
        )])
        .with_template("{}");

        let result = connector
            .launch(&context(), &stack, &notifier, AdjustmentType::Exact, 2)
            .await;

        assert!(matches!(result, Err(CloudError::Connector { .. })));
        assert!(!notifier.resources_for(&context().cloud_context).is_empty());
    }

    #[tokio::test]
    async fn terminate_tolerates_an_already_deleted_stack() {
        let mock = Arc::new(MockEc2::default());
        let connector = AwsConnector::new(mock, fast_config());
        let notifier = InMemoryNotifier::new();
        let resources = vec![CloudResource::new(
            ResourceType::AwsCloudFormationStack,
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
    async fn check_rejects_foreign_resource_types() {
        let connector = AwsConnector::new(Arc::new(MockEc2::default()), fast_config());
        let foreign = CloudResource::new(ResourceType::AzureTemplateDeployment, "dep");

        let result = connector.check(&context(), &[foreign]).await;

        assert!(matches!(result, Err(CloudError::Rejected(_))));
    }

    #[tokio::test]
    async fn downscale_terminates_exactly_the_computed_subset() {
        let mock = Arc::new(MockEc2::with_instances(&[("i-1", "running"), ("i-2", "running")]));
        let connector = AwsConnector::new(mock.clone(), fast_config());
        let notifier = InMemoryNotifier::new();
        let resources = vec![
            CloudResource::new(ResourceType::AwsInstance, "i-1").with_instance_id("i-1"),
            CloudResource::new(ResourceType::AwsInstance, "i-2").with_instance_id("i-2"),
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
                &[instance("i-2")],
            )
            .await
            .unwrap();
        let statuses = connector
            .downscale(
                &context(),
                &CloudStack::default(),
                &resources,
                &[instance("i-2")],
                to_remove,
                &notifier,
            )
            .await
            .unwrap();

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].resource.name, "i-2");
        assert!(mock.instances.lock().unwrap().contains_key("i-1"));
        assert!(!mock.instances.lock().unwrap().contains_key("i-2"));
        assert_eq!(notifier.resources_for(&context().cloud_context).len(), 1);
    }

    #[tokio::test]
    async fn unmatched_not_found_propagates_instead_of_looping() {
        let mock = Arc::new(MockEc2 {
            misreport_describe: true,
            ..MockEc2::default()
        });
        let connector = AwsConnector::new(mock.clone(), fast_config());

        let result = connector
            .check_instances(&context(), &[instance("i-1")])
            .await;

        // The reported id matches no tracked instance, so the working set
        // cannot shrink; the error surfaces after a single provider call.
        assert!(matches!(result, Err(CloudError::NotFound(_))));
        assert_eq!(mock.describe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn downscale_propagates_unmatched_not_found() {
        let mock = Arc::new(MockEc2 {
            misreport_terminate: true,
            ..MockEc2::default()
        });
        let connector = AwsConnector::new(mock.clone(), fast_config());
        let notifier = InMemoryNotifier::new();
        let to_remove =
            vec![CloudResource::new(ResourceType::AwsInstance, "i-1").with_instance_id("i-1")];

        let result = connector
            .downscale(
                &context(),
                &CloudStack::default(),
                &[],
                &[instance("i-1")],
                to_remove,
                &notifier,
            )
            .await;

        assert!(matches!(result, Err(CloudError::NotFound(_))));
        assert_eq!(mock.terminate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn database_operations_are_not_supported() {
        let connector = AwsConnector::new(Arc::new(MockEc2::default()), fast_config());
        let db = DatabaseStack::new("db-1", "postgres");

        let result = connector.database_server_status(&context(), &db).await;

        assert!(matches!(result, Err(CloudError::NotSupported(_))));
    }
}
