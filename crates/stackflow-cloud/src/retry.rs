//! Retry wrapper for provider calls
//!
//! Provider APIs are flaky at the transport level. Every outbound call goes
//! through [`with_retries`], which retries errors classified transient with
//! capped exponential backoff and re-raises the last error unchanged once
//! attempts are exhausted. Terminal errors (validation, not-found) bypass
//! the retry loop entirely.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Backoff policy for retried provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after the given zero-based attempt, capped at
    /// `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }
}

/// Invoke `call` until it succeeds, fails with a terminal error, or
/// `config.max_attempts` attempts are used up. The last error is returned
/// unchanged on exhaustion.
pub async fn with_retries<T, F, Fut>(config: &RetryConfig, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    attempt + 1,
                    config.max_attempts,
                    delay,
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!(
                        "{} failed after {} attempts: {}",
                        operation,
                        config.max_attempts,
                        e
                    );
                }
                return Err(e);
            }
        }
    }
}
