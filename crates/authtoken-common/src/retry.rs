//! Retry utilities with exponential backoff and jitter.
//!
//! Used for in-pass retries of cheap local calls (status writes racing another
//! writer). Cross-pass backoff for failed reconciles lives in the controller
//! and reuses [`exponential_delay`] and [`with_jitter`].
//!
//! # Example
//!
//! ```ignore
//! use authtoken_common::retry::{retry_with_backoff_if, RetryConfig};
//!
//! let status = retry_with_backoff_if(
//!     &RetryConfig::with_max_attempts(5),
//!     "commit_status",
//!     |e: &Error| e.is_stale_write(),
//!     || async { write_status().await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Un-jittered delay before retry number `attempt` (1-based)
///
/// `initial * multiplier^(attempt-1)`, capped at `max`.
pub fn exponential_delay(
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let secs = initial.as_secs_f64() * multiplier.powi(exponent);
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(secs)
}

/// Scale a delay by a random factor in 0.5x..1.5x
pub fn with_jitter(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Execute an async operation, retrying only errors accepted by `should_retry`.
///
/// Errors rejected by the predicate are returned immediately.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = with_jitter(exponential_delay(
                    config.initial_delay,
                    config.max_delay,
                    config.backoff_multiplier,
                    attempt,
                ));

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
