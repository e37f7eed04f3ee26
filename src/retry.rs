//! Backoff helper for optimistic-concurrency write loops
//!
//! Inventory writes use compare-and-swap semantics: the loser of a racing
//! write re-reads and re-applies its mutation. This module provides the
//! bounded retry loop those writers share, with exponential backoff and
//! jitter so competing writers do not collide in lockstep.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for a bounded retry loop
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Ceiling on the delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        // CAS retries are cheap but should stay bounded: after a handful of
        // losses the next watch event will re-enqueue the work anyway.
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is exhausted.
///
/// Between attempts, sleeps with exponential backoff and 0.5x-1.5x jitter.
/// The final error is returned unchanged so callers can classify it.
pub async fn with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let max_attempts = config.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt == max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis(),
                    "operation failed, retrying"
                );
                tokio::time::sleep(jittered).await;
                delay = (delay * 2).min(config.max_delay);
            }
        }
    }
    unreachable!("loop returns on success or final attempt")
}
