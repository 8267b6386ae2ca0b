//! AWS status vocabulary mapping
//!
//! Pure translation of EC2 instance states and CloudFormation stack
//! statuses into the canonical model. Unrecognized vocabulary maps to
//! `Unknown` (instances) or stays in progress (resources); mapping never
//! fails.

use stackflow_cloud::{InstanceStatus, ResourceStatus};

/// Map an EC2 instance state (plus optional state reason code) to the
/// canonical instance status. A `Server.*` reason on a stopped or
/// terminated instance means AWS killed it, which the platform reports as
/// a failure rather than a plain stop.
pub fn instance_status(state: &str, reason_code: Option<&str>) -> InstanceStatus {
    let lower = state.to_ascii_lowercase();
    let server_initiated = reason_code.is_some_and(|c| c.starts_with("Server."));
    match lower.as_str() {
        "pending" => InstanceStatus::InProgress,
        "running" => InstanceStatus::Started,
        "stopping" | "shutting-down" => InstanceStatus::InProgress,
        "stopped" => {
            if server_initiated {
                InstanceStatus::Failed
            } else {
                InstanceStatus::Stopped
            }
        }
        "terminated" => {
            if server_initiated {
                InstanceStatus::Failed
            } else {
                InstanceStatus::Terminated
            }
        }
        _ => InstanceStatus::Unknown,
    }
}

/// Canonical status for the EC2 state a power operation drives toward.
pub fn target_status(native_state: &str) -> InstanceStatus {
    instance_status(native_state, None)
}

/// Map a CloudFormation stack status to the canonical resource status.
pub fn resource_status(stack_status: &str) -> ResourceStatus {
    if stack_status.contains("ROLLBACK") || stack_status.ends_with("FAILED") {
        return ResourceStatus::Failed;
    }
    match stack_status {
        "CREATE_COMPLETE" => ResourceStatus::Created,
        "UPDATE_COMPLETE" => ResourceStatus::Updated,
        "DELETE_COMPLETE" => ResourceStatus::Deleted,
        // Everything else CloudFormation reports is a transition state.
        _ => ResourceStatus::InProgress,
    }
}
