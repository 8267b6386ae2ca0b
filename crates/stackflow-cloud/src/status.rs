//! Canonical two-tier status model
//!
//! Many independent workflow phases collapse into the handful of coarse
//! lifecycle statuses the rest of the platform reasons about. The binding is
//! total and static: every [`DetailedStatus`] maps to exactly one [`Status`]
//! through an exhaustive match, so adding a phase without classifying it is
//! a compile error. `Unknown` is the one sentinel that carries no coarse
//! status.

use serde::{Deserialize, Serialize};

/// Coarse lifecycle status consumed by the platform above the connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Requested,
    CreateInProgress,
    Available,
    CreateFailed,
    UpdateRequested,
    UpdateInProgress,
    UpdateFailed,
    StartRequested,
    StartInProgress,
    StartFailed,
    StopRequested,
    StopInProgress,
    Stopped,
    StopFailed,
    PreDeleteInProgress,
    DeleteInProgress,
    DeleteCompleted,
    DeleteFailed,
    DeletedOnProviderSide,
    WaitForSync,
    BackupInProgress,
    BackupFailed,
    RestoreInProgress,
    RestoreFailed,
    ExternalDatabaseCreationInProgress,
    ExternalDatabaseCreationFailed,
    ExternalDatabaseDeletionInProgress,
    ExternalDatabaseDeletionFinished,
    ExternalDatabaseDeletionFailed,
    LoadBalancerUpdateInProgress,
    LoadBalancerUpdateFailed,
}

/// Fine-grained workflow phase. Produced by the workflow layer driving the
/// connectors; compressed to a [`Status`] via [`DetailedStatus::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetailedStatus {
    Unknown,
    // Provisioning
    ProvisionRequested,
    ProvisionSetup,
    ImageSetup,
    CreatingInfrastructure,
    MetadataCollection,
    LoadBalancerMetadataCollection,
    TlsSetup,
    Provisioned,
    ProvisionFailed,
    // Orchestration
    BootstrappingMachines,
    CollectingHostMetadata,
    MountingDisks,
    StartingClusterServices,
    // Start
    StartRequested,
    StartInProgress,
    Started,
    StartFailed,
    // Stop
    StopRequested,
    StopInProgress,
    Stopped,
    StopFailed,
    // Upscale
    UpscaleRequested,
    AddingNewInstances,
    ExtendingMetadata,
    BootstrappingNewNodes,
    MountingDisksOnNewHosts,
    UpscaleCompleted,
    UpscaleFailed,
    // Downscale
    DownscaleRequested,
    DownscaleInProgress,
    DownscaleCompleted,
    DownscaleFailed,
    // Termination
    PreDeleteInProgress,
    DeleteInProgress,
    DeleteCompleted,
    DeleteFailed,
    DeletedOnProviderSide,
    // Rollback / repair
    RollingBack,
    RemoveInstance,
    RepairInProgress,
    RepairFailed,
    Retry,
    WaitForSync,
    Available,
    // External database
    ExternalDatabaseCreationInProgress,
    ExternalDatabaseCreationFailed,
    ExternalDatabaseDeletionInProgress,
    ExternalDatabaseDeletionFinished,
    ExternalDatabaseDeletionFailed,
    // Backup / restore
    DatabaseBackupInProgress,
    DatabaseBackupFinished,
    DatabaseBackupFailed,
    DatabaseRestoreInProgress,
    DatabaseRestoreFinished,
    DatabaseRestoreFailed,
    // Load balancer update
    CreatingCloudLoadBalancer,
    CollectingLoadBalancerMetadata,
    LoadBalancerUpdateFinished,
    LoadBalancerUpdateFailed,
}

impl DetailedStatus {
    /// Compress this phase to its coarse status. `Unknown` is the only phase
    /// with no classification and returns `None`.
    pub const fn status(self) -> Option<Status> {
        use DetailedStatus as D;
        Some(match self {
            D::Unknown => return None,
            // Provisioning
            D::ProvisionRequested => Status::Requested,
            D::ProvisionSetup
            | D::ImageSetup
            | D::CreatingInfrastructure
            | D::MetadataCollection
            | D::LoadBalancerMetadataCollection
            | D::TlsSetup => Status::CreateInProgress,
            D::Provisioned => Status::Available,
            D::ProvisionFailed => Status::CreateFailed,
            // Orchestration
            D::BootstrappingMachines
            | D::CollectingHostMetadata
            | D::MountingDisks
            | D::StartingClusterServices => Status::UpdateInProgress,
            // Start
            D::StartRequested => Status::StartRequested,
            D::StartInProgress => Status::StartInProgress,
            D::Started => Status::Available,
            D::StartFailed => Status::StartFailed,
            // Stop
            D::StopRequested => Status::StopRequested,
            D::StopInProgress => Status::StopInProgress,
            D::Stopped => Status::Stopped,
            D::StopFailed => Status::StopFailed,
            // Upscale
            D::UpscaleRequested => Status::UpdateRequested,
            D::AddingNewInstances
            | D::ExtendingMetadata
            | D::BootstrappingNewNodes
            | D::MountingDisksOnNewHosts => Status::UpdateInProgress,
            // A failed scale-up leaves the previously running stack usable.
            D::UpscaleCompleted | D::UpscaleFailed => Status::Available,
            // Downscale
            D::DownscaleRequested => Status::UpdateRequested,
            D::DownscaleInProgress => Status::UpdateInProgress,
            D::DownscaleCompleted | D::DownscaleFailed => Status::Available,
            // Termination
            D::PreDeleteInProgress => Status::PreDeleteInProgress,
            D::DeleteInProgress => Status::DeleteInProgress,
            D::DeleteCompleted => Status::DeleteCompleted,
            D::DeleteFailed => Status::DeleteFailed,
            D::DeletedOnProviderSide => Status::DeletedOnProviderSide,
            // Rollback / repair
            D::RollingBack | D::RemoveInstance | D::RepairInProgress | D::Retry => {
                Status::UpdateInProgress
            }
            D::RepairFailed => Status::UpdateFailed,
            D::WaitForSync => Status::WaitForSync,
            D::Available => Status::Available,
            // External database
            D::ExternalDatabaseCreationInProgress => Status::ExternalDatabaseCreationInProgress,
            D::ExternalDatabaseCreationFailed => Status::ExternalDatabaseCreationFailed,
            D::ExternalDatabaseDeletionInProgress => Status::ExternalDatabaseDeletionInProgress,
            D::ExternalDatabaseDeletionFinished => Status::ExternalDatabaseDeletionFinished,
            D::ExternalDatabaseDeletionFailed => Status::ExternalDatabaseDeletionFailed,
            // Backup / restore
            D::DatabaseBackupInProgress => Status::BackupInProgress,
            D::DatabaseBackupFinished => Status::Available,
            D::DatabaseBackupFailed => Status::BackupFailed,
            D::DatabaseRestoreInProgress => Status::RestoreInProgress,
            D::DatabaseRestoreFinished => Status::Available,
            D::DatabaseRestoreFailed => Status::RestoreFailed,
            // Load balancer update
            D::CreatingCloudLoadBalancer | D::CollectingLoadBalancerMetadata => {
                Status::LoadBalancerUpdateInProgress
            }
            D::LoadBalancerUpdateFinished => Status::Available,
            D::LoadBalancerUpdateFailed => Status::LoadBalancerUpdateFailed,
        })
    }
}
