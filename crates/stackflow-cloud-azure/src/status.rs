//! Azure status vocabulary mapping
//!
//! Pure translation of VM power states, ARM provisioning states and
//! flexible-server states into the canonical model. Unrecognized vocabulary
//! maps to `Unknown`; mapping never fails.

use stackflow_cloud::{ExternalDatabaseStatus, InstanceStatus, ResourceStatus};

/// Map a VM power state (plus provisioning state) to the canonical instance
/// status. A failed provisioning state wins over any power state.
pub fn instance_status(power_state: &str, provisioning_state: &str) -> InstanceStatus {
    if provisioning_state.eq_ignore_ascii_case("failed") {
        return InstanceStatus::Failed;
    }
    match power_state.to_ascii_lowercase().as_str() {
        "running" => InstanceStatus::Started,
        "starting" => InstanceStatus::InProgress,
        "stopping" | "deallocating" => InstanceStatus::InProgress,
        "stopped" | "deallocated" => InstanceStatus::Stopped,
        _ => InstanceStatus::Unknown,
    }
}

/// Map an ARM deployment provisioning state to the canonical resource
/// status.
pub fn resource_status(provisioning_state: &str) -> ResourceStatus {
    match provisioning_state.to_ascii_lowercase().as_str() {
        "succeeded" => ResourceStatus::Created,
        "failed" | "canceled" => ResourceStatus::Failed,
        // Accepted, Running, Deleting and friends are all transitions.
        _ => ResourceStatus::InProgress,
    }
}

/// Map a flexible-server state to the canonical database status.
pub fn database_status(state: &str) -> ExternalDatabaseStatus {
    match state.to_ascii_lowercase().as_str() {
        "ready" => ExternalDatabaseStatus::Started,
        "stopped" => ExternalDatabaseStatus::Stopped,
        "starting" | "stopping" | "updating" | "dropping" => {
            ExternalDatabaseStatus::UpdateInProgress
        }
        _ => ExternalDatabaseStatus::Unknown,
    }
}
