//! Azure API access
//!
//! The connector talks to Azure Resource Manager through the [`ArmApi`]
//! capability trait so tests can substitute an in-memory fake. [`AzCli`] is
//! the production implementation, wrapping the `az` CLI with JSON output
//! parsing. ARM template bodies are handed to the CLI through a temp file.

use crate::error::{AzureError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Write;
use std::process::Stdio;
use tokio::process::Command;

/// One ARM template deployment as reported by `deployment group show`.
#[derive(Debug, Clone)]
pub struct ArmDeployment {
    pub name: String,
    pub provisioning_state: String,
}

/// One resource produced by a deployment, identified by its ARM id.
#[derive(Debug, Clone)]
pub struct ArmResourceRef {
    /// Full ARM id, e.g.
    /// `/subscriptions/.../providers/Microsoft.Compute/virtualMachines/vm-1`.
    pub id: String,
}

impl ArmResourceRef {
    /// Trailing segment of the ARM id.
    pub fn name(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }

    /// `Provider/type` pair from the ARM id, e.g.
    /// `Microsoft.Compute/virtualMachines`.
    pub fn provider_type(&self) -> Option<String> {
        let segments: Vec<&str> = self.id.split('/').collect();
        let provider_index = segments.iter().position(|s| *s == "providers")?;
        let provider = segments.get(provider_index + 1)?;
        let kind = segments.get(provider_index + 2)?;
        Some(format!("{provider}/{kind}"))
    }
}

/// One VM instance view.
#[derive(Debug, Clone)]
pub struct VmView {
    pub name: String,
    /// Power state suffix: `running`, `deallocated`, `starting`, ...
    pub power_state: String,
    pub provisioning_state: String,
}

/// One managed database server as reported by `flexible-server show`.
#[derive(Debug, Clone)]
pub struct DbServer {
    pub name: String,
    pub state: String,
}

/// Describe/mutate capability set the Azure connector needs. All operations
/// are scoped to one resource group.
#[async_trait]
pub trait ArmApi: Send + Sync {
    /// `Ok(None)` when the deployment does not exist.
    async fn get_deployment(
        &self,
        resource_group: &str,
        deployment: &str,
    ) -> Result<Option<ArmDeployment>>;

    async fn create_deployment(
        &self,
        resource_group: &str,
        deployment: &str,
        template_body: &str,
    ) -> Result<()>;

    async fn list_deployment_resources(
        &self,
        resource_group: &str,
        deployment: &str,
    ) -> Result<Vec<ArmResourceRef>>;

    async fn delete_resource_group(&self, resource_group: &str) -> Result<()>;

    /// `Ok(None)` when the VM does not exist.
    async fn get_vm_view(&self, resource_group: &str, vm_name: &str) -> Result<Option<VmView>>;

    async fn start_vm(&self, resource_group: &str, vm_name: &str) -> Result<()>;

    async fn deallocate_vm(&self, resource_group: &str, vm_name: &str) -> Result<()>;

    async fn delete_vm(&self, resource_group: &str, vm_name: &str) -> Result<()>;

    async fn create_database_server(
        &self,
        resource_group: &str,
        server_name: &str,
    ) -> Result<()>;

    /// `Ok(None)` when the server does not exist.
    async fn get_database_server(
        &self,
        resource_group: &str,
        server_name: &str,
    ) -> Result<Option<DbServer>>;

    async fn delete_database_server(&self, resource_group: &str, server_name: &str) -> Result<()>;
}

/// `az` CLI wrapper.
pub struct AzCli;

impl AzCli {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("az");
        cmd.args(args);
        cmd.arg("--output").arg("json");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("running: az {}", args.join(" "));

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AzureError::CliNotFound
            } else {
                AzureError::Io(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for AzCli {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a failed CLI invocation onto the error taxonomy from its stderr.
fn classify_failure(stderr: &str) -> AzureError {
    const TRANSIENT_MARKERS: [&str; 5] = [
        "TooManyRequests",
        "429",
        "ServiceUnavailable",
        "Connection aborted",
        "timed out",
    ];
    if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        return AzureError::Transport(stderr.trim().to_string());
    }
    const NOT_FOUND_MARKERS: [&str; 4] = [
        "ResourceNotFound",
        "ResourceGroupNotFound",
        "DeploymentNotFound",
        "was not found",
    ];
    if NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m)) {
        return AzureError::NotFound(stderr.trim().to_string());
    }
    AzureError::Api(stderr.trim().to_string())
}

#[derive(Debug, Deserialize)]
struct RawDeployment {
    name: String,
    properties: RawDeploymentProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDeploymentProperties {
    provisioning_state: String,
    #[serde(default)]
    output_resources: Vec<RawResourceRef>,
}

#[derive(Debug, Deserialize)]
struct RawResourceRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVm {
    name: String,
    #[serde(default)]
    instance_view: Option<RawInstanceView>,
    #[serde(default)]
    provisioning_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawInstanceView {
    #[serde(default)]
    statuses: Vec<RawVmStatus>,
}

#[derive(Debug, Deserialize)]
struct RawVmStatus {
    code: String,
}

#[derive(Debug, Deserialize)]
struct RawDbServer {
    name: String,
    state: String,
}

fn power_state_from_statuses(statuses: &[RawVmStatus]) -> String {
    statuses
        .iter()
        .filter_map(|s| s.code.strip_prefix("PowerState/"))
        .next_back()
        .unwrap_or("unknown")
        .to_string()
}

#[async_trait]
impl ArmApi for AzCli {
    async fn get_deployment(
        &self,
        resource_group: &str,
        deployment: &str,
    ) -> Result<Option<ArmDeployment>> {
        let result = self
            .run(&[
                "deployment", "group", "show",
                "--resource-group", resource_group,
                "--name", deployment,
            ])
            .await;
        match result {
            Ok(output) => {
                let parsed: RawDeployment = serde_json::from_str(&output)?;
                Ok(Some(ArmDeployment {
                    name: parsed.name,
                    provisioning_state: parsed.properties.provisioning_state,
                }))
            }
            Err(AzureError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_deployment(
        &self,
        resource_group: &str,
        deployment: &str,
        template_body: &str,
    ) -> Result<()> {
        // The CLI reads templates from disk only.
        let mut template_file = tempfile::Builder::new()
            .prefix("arm-template-")
            .suffix(".json")
            .tempfile()?;
        template_file.write_all(template_body.as_bytes())?;
        let path = template_file.path().to_string_lossy().to_string();
        self.run(&[
            "deployment", "group", "create",
            "--resource-group", resource_group,
            "--name", deployment,
            "--template-file", &path,
        ])
        .await?;
        Ok(())
    }

    async fn list_deployment_resources(
        &self,
        resource_group: &str,
        deployment: &str,
    ) -> Result<Vec<ArmResourceRef>> {
        let output = self
            .run(&[
                "deployment", "group", "show",
                "--resource-group", resource_group,
                "--name", deployment,
            ])
            .await?;
        let parsed: RawDeployment = serde_json::from_str(&output)?;
        Ok(parsed
            .properties
            .output_resources
            .into_iter()
            .map(|r| ArmResourceRef { id: r.id })
            .collect())
    }

    async fn delete_resource_group(&self, resource_group: &str) -> Result<()> {
        self.run(&["group", "delete", "--name", resource_group, "--yes"])
            .await?;
        Ok(())
    }

    async fn get_vm_view(&self, resource_group: &str, vm_name: &str) -> Result<Option<VmView>> {
        let result = self
            .run(&[
                "vm", "get-instance-view",
                "--resource-group", resource_group,
                "--name", vm_name,
            ])
            .await;
        match result {
            Ok(output) => {
                let parsed: RawVm = serde_json::from_str(&output)?;
                let power_state = parsed
                    .instance_view
                    .as_ref()
                    .map(|v| power_state_from_statuses(&v.statuses))
                    .unwrap_or_else(|| "unknown".to_string());
                Ok(Some(VmView {
                    name: parsed.name,
                    power_state,
                    provisioning_state: parsed.provisioning_state.unwrap_or_default(),
                }))
            }
            Err(AzureError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn start_vm(&self, resource_group: &str, vm_name: &str) -> Result<()> {
        self.run(&["vm", "start", "--resource-group", resource_group, "--name", vm_name])
            .await?;
        Ok(())
    }

    async fn deallocate_vm(&self, resource_group: &str, vm_name: &str) -> Result<()> {
        self.run(&["vm", "deallocate", "--resource-group", resource_group, "--name", vm_name])
            .await?;
        Ok(())
    }

    async fn delete_vm(&self, resource_group: &str, vm_name: &str) -> Result<()> {
        self.run(&["vm", "delete", "--resource-group", resource_group, "--name", vm_name, "--yes"])
            .await?;
        Ok(())
    }

    async fn create_database_server(
        &self,
        resource_group: &str,
        server_name: &str,
    ) -> Result<()> {
        self.run(&[
            "postgres", "flexible-server", "create",
            "--resource-group", resource_group,
            "--name", server_name,
            "--yes",
        ])
        .await?;
        Ok(())
    }

    async fn get_database_server(
        &self,
        resource_group: &str,
        server_name: &str,
    ) -> Result<Option<DbServer>> {
        let result = self
            .run(&[
                "postgres", "flexible-server", "show",
                "--resource-group", resource_group,
                "--name", server_name,
            ])
            .await;
        match result {
            Ok(output) => {
                let parsed: RawDbServer = serde_json::from_str(&output)?;
                Ok(Some(DbServer {
                    name: parsed.name,
                    state: parsed.state,
                }))
            }
            Err(AzureError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_database_server(&self, resource_group: &str, server_name: &str) -> Result<()> {
        self.run(&[
            "postgres", "flexible-server", "delete",
            "--resource-group", resource_group,
            "--name", server_name,
            "--yes",
        ])
        .await?;
        Ok(())
    }
}
