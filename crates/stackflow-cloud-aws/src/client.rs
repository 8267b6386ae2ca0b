//! AWS API access
//!
//! The connector talks to AWS through the [`Ec2Api`] capability trait so
//! tests can substitute an in-memory fake. [`AwsCli`] is the production
//! implementation, wrapping the `aws` CLI with JSON output parsing.

use crate::error::{AwsError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;

/// One EC2 instance as reported by describe-instances.
#[derive(Debug, Clone)]
pub struct Ec2Instance {
    pub instance_id: String,
    pub state: String,
    pub state_reason_code: Option<String>,
    pub state_reason_message: Option<String>,
}

/// One CloudFormation stack as reported by describe-stacks.
#[derive(Debug, Clone)]
pub struct CfnStack {
    pub name: String,
    pub status: String,
}

/// One entry of list-stack-resources.
#[derive(Debug, Clone)]
pub struct CfnResourceSummary {
    pub logical_id: String,
    pub physical_id: String,
    pub resource_type: String,
    pub status: String,
}

/// Describe/mutate capability set the AWS connector needs.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn describe_instances(&self, instance_ids: &[String]) -> Result<Vec<Ec2Instance>>;

    async fn start_instances(&self, instance_ids: &[String]) -> Result<()>;

    async fn stop_instances(&self, instance_ids: &[String]) -> Result<()>;

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()>;

    /// `Ok(None)` when the stack does not exist.
    async fn describe_stack(&self, stack_name: &str) -> Result<Option<CfnStack>>;

    async fn create_stack(&self, stack_name: &str, template_body: &str) -> Result<()>;

    async fn update_stack(&self, stack_name: &str, template_body: &str) -> Result<()>;

    async fn delete_stack(&self, stack_name: &str) -> Result<()>;

    async fn list_stack_resources(&self, stack_name: &str) -> Result<Vec<CfnResourceSummary>>;
}

/// `aws` CLI wrapper.
pub struct AwsCli {
    region: String,
}

impl AwsCli {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("aws");
        cmd.args(args);
        cmd.arg("--region").arg(&self.region);
        cmd.arg("--output").arg("json");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("running: aws {} --region {}", args.join(" "), self.region);

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AwsError::CliNotFound
            } else {
                AwsError::Io(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Map a failed CLI invocation onto the error taxonomy from its stderr.
fn classify_failure(stderr: &str) -> AwsError {
    const TRANSIENT_MARKERS: [&str; 5] = [
        "Throttling",
        "RequestLimitExceeded",
        "ServiceUnavailable",
        "Could not connect",
        "timed out",
    ];
    if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        return AwsError::Transport(stderr.trim().to_string());
    }
    if stderr.contains("InvalidInstanceID.NotFound") {
        let instance_id = extract_instance_id(stderr).unwrap_or_else(|| "unknown".to_string());
        return AwsError::InstanceNotFound { instance_id };
    }
    if stderr.contains("does not exist") || stderr.contains("ValidationError") && stderr.contains("not exist") {
        return AwsError::StackNotFound(stderr.trim().to_string());
    }
    AwsError::Api(stderr.trim().to_string())
}

/// Pull the offending `i-xxxxxxxx` id out of an error message.
fn extract_instance_id(message: &str) -> Option<String> {
    let start = message.find("'i-").map(|p| p + 1).or_else(|| {
        message
            .find("i-")
            .filter(|&p| p == 0 || !message.as_bytes()[p - 1].is_ascii_alphanumeric())
    })?;
    let id: String = message[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if id.len() > 2 { Some(id) } else { None }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    instances: Vec<RawInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInstance {
    instance_id: String,
    state: RawState,
    state_reason: Option<RawStateReason>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawStateReason {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacksOutput {
    stacks: Vec<RawStack>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawStack {
    stack_name: String,
    stack_status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListStackResourcesOutput {
    stack_resource_summaries: Vec<RawStackResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawStackResource {
    logical_resource_id: String,
    #[serde(default)]
    physical_resource_id: Option<String>,
    resource_type: String,
    resource_status: String,
}

#[async_trait]
impl Ec2Api for AwsCli {
    async fn describe_instances(&self, instance_ids: &[String]) -> Result<Vec<Ec2Instance>> {
        let mut args = vec!["ec2", "describe-instances", "--instance-ids"];
        args.extend(instance_ids.iter().map(String::as_str));
        let output = self.run(&args).await?;
        let parsed: DescribeInstancesOutput = serde_json::from_str(&output)?;
        Ok(parsed
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(|i| Ec2Instance {
                instance_id: i.instance_id,
                state: i.state.name,
                state_reason_code: i.state_reason.as_ref().and_then(|r| r.code.clone()),
                state_reason_message: i.state_reason.and_then(|r| r.message),
            })
            .collect())
    }

    async fn start_instances(&self, instance_ids: &[String]) -> Result<()> {
        let mut args = vec!["ec2", "start-instances", "--instance-ids"];
        args.extend(instance_ids.iter().map(String::as_str));
        self.run(&args).await?;
        Ok(())
    }

    async fn stop_instances(&self, instance_ids: &[String]) -> Result<()> {
        let mut args = vec!["ec2", "stop-instances", "--instance-ids"];
        args.extend(instance_ids.iter().map(String::as_str));
        self.run(&args).await?;
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        let mut args = vec!["ec2", "terminate-instances", "--instance-ids"];
        args.extend(instance_ids.iter().map(String::as_str));
        self.run(&args).await?;
        Ok(())
    }

    async fn describe_stack(&self, stack_name: &str) -> Result<Option<CfnStack>> {
        let result = self
            .run(&["cloudformation", "describe-stacks", "--stack-name", stack_name])
            .await;
        match result {
            Ok(output) => {
                let parsed: DescribeStacksOutput = serde_json::from_str(&output)?;
                Ok(parsed.stacks.into_iter().next().map(|s| CfnStack {
                    name: s.stack_name,
                    status: s.stack_status,
                }))
            }
            Err(AwsError::StackNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_stack(&self, stack_name: &str, template_body: &str) -> Result<()> {
        self.run(&[
            "cloudformation",
            "create-stack",
            "--stack-name",
            stack_name,
            "--template-body",
            template_body,
        ])
        .await?;
        Ok(())
    }

    async fn update_stack(&self, stack_name: &str, template_body: &str) -> Result<()> {
        self.run(&[
            "cloudformation",
            "update-stack",
            "--stack-name",
            stack_name,
            "--template-body",
            template_body,
        ])
        .await?;
        Ok(())
    }

    async fn delete_stack(&self, stack_name: &str) -> Result<()> {
        self.run(&["cloudformation", "delete-stack", "--stack-name", stack_name])
            .await?;
        Ok(())
    }

    async fn list_stack_resources(&self, stack_name: &str) -> Result<Vec<CfnResourceSummary>> {
        let output = self
            .run(&["cloudformation", "list-stack-resources", "--stack-name", stack_name])
            .await?;
        let parsed: ListStackResourcesOutput = serde_json::from_str(&output)?;
        Ok(parsed
            .stack_resource_summaries
            .into_iter()
            .map(|r| CfnResourceSummary {
                logical_id: r.logical_resource_id,
                physical_id: r.physical_resource_id.unwrap_or_default(),
                resource_type: r.resource_type,
                status: r.resource_status,
            })
            .collect())
    }
}
