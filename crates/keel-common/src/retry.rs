//! Bounded retry for optimistic-concurrency writes.
//!
//! Writes against a versioned store fail with a conflict when another writer
//! got there first. [`retry_on_conflict`] re-runs an attempt (re-read, reapply,
//! rewrite) until it succeeds, fails with a non-conflict error, or the attempt
//! ceiling is reached. Exhausting the ceiling is reported explicitly.
//!
//! # Example
//!
//! ```ignore
//! use keel_common::retry::{retry_on_conflict, RetryConfig};
//!
//! let app = retry_on_conflict(&RetryConfig::conflicts(), "update_app", Error::is_conflict, |attempt| {
//!     let store = store.clone();
//!     async move {
//!         let mut current = if attempt == 0 { first.clone() } else { store.get(ns, name).await? };
//!         apply_delta(&mut current);
//!         store.update(&current).await
//!     }
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Configuration for conflict retries.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::conflicts()
    }
}

impl RetryConfig {
    /// Ten attempts with a short, growing pause between conflicts
    pub fn conflicts() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
        }
    }

    /// A fixed pause between conflicts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }
}

/// Why a conflict-retry loop gave up
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt ended in a conflict
    Exhausted {
        /// Attempts made
        attempts: u32,
    },
    /// An attempt failed with a non-conflict error
    Failed(E),
}

/// Run `attempt` until it succeeds, fails with a non-conflict error, or the
/// configured number of attempts ends in conflicts.
///
/// `attempt` receives the zero-based attempt number so the first attempt can
/// reuse an already-read object and later attempts can re-read it.
pub async fn retry_on_conflict<F, Fut, T, E, C>(
    config: &RetryConfig,
    operation_name: &str,
    is_conflict: C,
    mut attempt: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;

    for n in 0..config.max_attempts {
        match attempt(n).await {
            Ok(result) => return Ok(result),
            Err(e) if is_conflict(&e) => {
                debug!(
                    operation = %operation_name,
                    attempt = n + 1,
                    error = %e,
                    "Write conflicted, retrying"
                );
            }
            Err(e) => return Err(RetryError::Failed(e)),
        }

        if n + 1 < config.max_attempts && !delay.is_zero() {
            // Add jitter: 0.5x to 1.5x of the delay
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            tokio::time::sleep(Duration::from_secs_f64(delay.as_secs_f64() * jitter)).await;
            delay = Duration::from_secs_f64(
                (delay.as_secs_f64() * config.backoff_multiplier)
                    .min(config.max_delay.as_secs_f64()),
            );
        }
    }

    warn!(
        operation = %operation_name,
        attempts = config.max_attempts,
        "Giving up after repeated write conflicts"
    );
    Err(RetryError::Exhausted {
        attempts: config.max_attempts,
    })
}
