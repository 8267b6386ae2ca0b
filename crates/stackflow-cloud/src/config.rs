//! Connector configuration
//!
//! Loaded once at startup (typically from a JSON/YAML fragment of the host
//! application's configuration) and passed read-only to the connector
//! constructors.

use crate::poller::PollerConfig;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};

/// Immutable tuning for one connector: backoff around provider calls and
/// convergence polling cadence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub retry: RetryConfig,
    pub poller: PollerConfig,
}
