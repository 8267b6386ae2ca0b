//! Stackflow cloud abstraction
//!
//! Provider-agnostic resource lifecycle reconciliation: an external
//! orchestrator asks for outcomes (launch, stop, upscale), a provider
//! connector translates them into vendor API calls, tolerates the
//! provider's asynchronous and eventually-consistent behavior, and reports
//! a converged status back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │            workflow / orchestrator               │
//! └─────────────────┬────────────────────────────────┘
//!                   │
//! ┌─────────────────▼────────────────────────────────┐
//! │              stackflow-cloud                     │
//! │  trait CloudConnector { launch, check, ... }     │
//! │  ┌──────────────┐ ┌─────────┐ ┌──────────────┐   │
//! │  │ retry/backoff│ │ poller  │ │  persistence │   │
//! │  └──────────────┘ └─────────┘ └──────────────┘   │
//! └────────┬───────────────────┬─────────────────────┘
//!          │                   │
//! ┌────────▼───────┐   ┌───────▼────────┐
//! │  aws connector │   │ azure connector│
//! └────────────────┘   └────────────────┘
//! ```

pub mod config;
pub mod connector;
pub mod context;
pub mod error;
pub mod model;
pub mod notifier;
pub mod poller;
pub mod retry;
pub mod scaling;
pub mod status;

// Re-exports
pub use config::ConnectorConfig;
pub use connector::CloudConnector;
pub use context::{AuthenticatedContext, CloudContext, Location};
pub use error::{CloudError, Result};
pub use model::{
    AdjustmentType, CloudInstance, CloudResource, CloudResourceStatus, CloudStack,
    CloudVmInstanceStatus, DatabaseStack, ExternalDatabaseStatus, InstanceGroup, InstanceStatus,
    Platform, ResourceStatus, ResourceType,
};
pub use notifier::{FileNotifier, InMemoryNotifier, PersistenceNotifier};
pub use poller::{ExitCriteria, PollOutcome, PollResult, PollerConfig, wait_for_statuses};
pub use retry::{RetryConfig, with_retries};
pub use status::{DetailedStatus, Status};
