//! Convergence poller
//!
//! Asynchronous provider mutations (start, stop, launch) only request a
//! state change; the poller repeatedly re-checks instance status until every
//! tracked instance reaches one of the target statuses or `Failed`, the
//! caller cancels, or the bounded wait elapses. It never polls tighter than
//! the configured interval.

use crate::error::Result;
use crate::model::{CloudInstance, CloudVmInstanceStatus, InstanceStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Polling cadence and upper wait bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    pub interval_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            max_wait_ms: 600_000,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Cooperative cancellation signal checked between poll iterations.
/// Cancelling never revokes an already-issued provider mutation.
#[derive(Debug, Clone, Default)]
pub struct ExitCriteria {
    cancelled: Arc<AtomicBool>,
}

impl ExitCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every tracked instance reached a target status or `Failed`.
    Converged,
    /// The caller's exit criteria fired; statuses are the last observed.
    Cancelled,
    /// The bounded wait elapsed; outstanding instances are reported `Failed`.
    TimedOut,
}

/// Final statuses plus the reason the wait ended.
#[derive(Debug, Clone)]
pub struct PollResult {
    pub outcome: PollOutcome,
    pub statuses: Vec<CloudVmInstanceStatus>,
}

fn is_terminal(status: InstanceStatus, targets: &HashSet<InstanceStatus>) -> bool {
    targets.contains(&status) || status == InstanceStatus::Failed
}

/// Wait until every instance reaches one of `targets` or `Failed`.
///
/// `check` is invoked once per iteration with the instances still being
/// tracked; instances it stops reporting (deleted out of band) are dropped
/// from the working set. An empty instance set returns immediately without
/// invoking `check`.
pub async fn wait_for_statuses<F, Fut>(
    config: &PollerConfig,
    instances: Vec<CloudInstance>,
    targets: &HashSet<InstanceStatus>,
    exit: Option<&ExitCriteria>,
    check: F,
) -> Result<PollResult>
where
    F: Fn(Vec<CloudInstance>) -> Fut,
    Fut: Future<Output = Result<Vec<CloudVmInstanceStatus>>>,
{
    if instances.is_empty() {
        return Ok(PollResult {
            outcome: PollOutcome::Converged,
            statuses: Vec::new(),
        });
    }

    let deadline = Instant::now() + config.max_wait();
    let mut tracked = instances;
    let mut last: Vec<CloudVmInstanceStatus> = Vec::new();

    loop {
        if let Some(criteria) = exit {
            if criteria.is_cancelled() {
                tracing::info!("status wait cancelled with {} instances tracked", tracked.len());
                return Ok(PollResult {
                    outcome: PollOutcome::Cancelled,
                    statuses: last,
                });
            }
        }

        let statuses = check(tracked.clone()).await?;

        // Instances the provider no longer reports were deleted out of band.
        let before = tracked.len();
        tracked.retain(|instance| {
            statuses
                .iter()
                .any(|s| s.instance.instance_id() == instance.instance_id())
        });
        if tracked.len() < before {
            tracing::warn!(
                "{} instance(s) disappeared from the provider while waiting",
                before - tracked.len()
            );
        }
        last = statuses;

        if tracked.is_empty() || last.iter().all(|s| is_terminal(s.status, targets)) {
            return Ok(PollResult {
                outcome: PollOutcome::Converged,
                statuses: last,
            });
        }

        if Instant::now() + config.interval() >= deadline {
            let statuses = last
                .into_iter()
                .map(|s| {
                    if is_terminal(s.status, targets) {
                        s
                    } else {
                        let instance = s.instance;
                        CloudVmInstanceStatus::new(instance, InstanceStatus::Failed)
                            .with_reason(format!(
                                "did not reach target status within {:?}",
                                config.max_wait()
                            ))
                    }
                })
                .collect();
            tracing::warn!("status wait timed out after {:?}", config.max_wait());
            return Ok(PollResult {
                outcome: PollOutcome::TimedOut,
                statuses,
            });
        }

        sleep(config.interval()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> PollerConfig {
        PollerConfig {
            interval_ms: 1,
            max_wait_ms: 1000,
        }
    }

    fn instance(id: &str) -> CloudInstance {
        CloudInstance::new(Some(id.to_string()), "worker")
    }

    fn started_targets() -> HashSet<InstanceStatus> {
        [InstanceStatus::Started].into_iter().collect()
    }

    #[tokio::test]
    async fn empty_instance_set_returns_without_checking() {
        let calls = AtomicU32::new(0);
        let result = wait_for_statuses(&fast_config(), Vec::new(), &started_targets(), None, |vms| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(vms
                    .into_iter()
                    .map(|i| CloudVmInstanceStatus::new(i, InstanceStatus::Started))
                    .collect())
            }
        })
        .await
        .unwrap();
        assert_eq!(result.outcome, PollOutcome::Converged);
        assert!(result.statuses.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn converges_once_all_instances_are_terminal() {
        // Four instances: three reach Started on different iterations, one
        // fails. The poller must stop on the iteration where the last one
        // becomes terminal.
        let iteration = AtomicU32::new(0);
        let instances = vec![instance("i-1"), instance("i-2"), instance("i-3"), instance("i-4")];
        let result = wait_for_statuses(
            &fast_config(),
            instances,
            &started_targets(),
            None,
            |vms| {
                let n = iteration.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(vms
                        .into_iter()
                        .map(|i| {
                            let status = match (i.instance_id().unwrap_or(""), n) {
                                ("i-1", _) => InstanceStatus::Started,
                                ("i-2", n) if n >= 1 => InstanceStatus::Started,
                                ("i-3", n) if n >= 2 => InstanceStatus::Started,
                                ("i-4", n) if n >= 2 => InstanceStatus::Failed,
                                _ => InstanceStatus::InProgress,
                            };
                            CloudVmInstanceStatus::new(i, status)
                        })
                        .collect())
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result.outcome, PollOutcome::Converged);
        assert_eq!(iteration.load(Ordering::SeqCst), 3);
        let failed: Vec<_> = result
            .statuses
            .iter()
            .filter(|s| s.status == InstanceStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].instance.instance_id(), Some("i-4"));
    }

    #[tokio::test]
    async fn disappeared_instances_are_dropped_from_tracking() {
        let result = wait_for_statuses(
            &fast_config(),
            vec![instance("i-1"), instance("i-2")],
            &started_targets(),
            None,
            |vms| async move {
                // i-2 is never reported back: deleted out of band.
                Ok(vms
                    .into_iter()
                    .filter(|i| i.instance_id() == Some("i-1"))
                    .map(|i| CloudVmInstanceStatus::new(i, InstanceStatus::Started))
                    .collect())
            },
        )
        .await
        .unwrap();
        assert_eq!(result.outcome, PollOutcome::Converged);
        assert_eq!(result.statuses.len(), 1);
    }

    #[tokio::test]
    async fn timeout_marks_outstanding_instances_failed() {
        let config = PollerConfig {
            interval_ms: 1,
            max_wait_ms: 5,
        };
        let result = wait_for_statuses(
            &config,
            vec![instance("i-1")],
            &started_targets(),
            None,
            |vms| async move {
                Ok(vms
                    .into_iter()
                    .map(|i| CloudVmInstanceStatus::new(i, InstanceStatus::InProgress))
                    .collect())
            },
        )
        .await
        .unwrap();
        assert_eq!(result.outcome, PollOutcome::TimedOut);
        assert_eq!(result.statuses[0].status, InstanceStatus::Failed);
        assert!(result.statuses[0].reason.is_some());
    }

    #[tokio::test]
    async fn cancellation_reports_last_observed_statuses() {
        let exit = ExitCriteria::new();
        let observed = Mutex::new(0u32);
        let exit_for_check = exit.clone();
        let result = wait_for_statuses(
            &fast_config(),
            vec![instance("i-1")],
            &started_targets(),
            Some(&exit),
            |vms| {
                // Cancel after the first observation.
                let mut n = observed.lock().unwrap();
                *n += 1;
                if *n >= 1 {
                    exit_for_check.cancel();
                }
                drop(n);
                async move {
                    Ok(vms
                        .into_iter()
                        .map(|i| CloudVmInstanceStatus::new(i, InstanceStatus::InProgress))
                        .collect())
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result.outcome, PollOutcome::Cancelled);
        assert_eq!(result.statuses.len(), 1);
        assert_eq!(result.statuses[0].status, InstanceStatus::InProgress);
    }
}
