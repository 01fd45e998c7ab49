//! Bounded retry for eventually consistent reads.
//!
//! The cluster inventory can lag behind a finished create task. Callers
//! retry only the errors that indicate such lag and fail fast on anything
//! else.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Retry configuration for operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Retry up to `max_attempts` times with a constant delay.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        std::cmp::min(
            self.max_delay,
            Duration::from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier),
        )
    }
}

impl Default for RetryConfig {
    /// Five attempts, five seconds apart.
    fn default() -> Self {
        Self::fixed(5, Duration::from_secs(5))
    }
}

/// Why a retried operation gave up.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
    /// An attempt failed with an error that is not retried.
    #[error("{0}")]
    Aborted(E),
}

/// Execute an async function, retrying errors accepted by `retryable`.
///
/// # Errors
/// Returns `Aborted` on the first non-retryable error, `Exhausted` when
/// all attempts fail.
pub async fn with_retry_async<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: P,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !retryable(&e) => return Err(RetryError::Aborted(e)),
            Err(e) => {
                if attempt >= config.max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }

                warn!(
                    "{operation_name} failed (attempt {attempt}/{}): {e}. Retrying in {delay:?}...",
                    config.max_attempts
                );

                tokio::time::sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(attempts: u32) -> RetryConfig {
        RetryConfig::fixed(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_secs(5));
        assert_eq!(config.next_delay(config.initial_delay), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(6),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.next_delay(Duration::from_secs(4)), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_succeeds_after_retryable_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, RetryError<String>> =
            with_retry_async(&quick(5), "lookup", |_| true, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("not yet ({n})"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> =
            with_retry_async(&quick(4), "lookup", |_| true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("missing")
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 4, last: "missing" })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_aborts_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> = with_retry_async(
            &quick(5),
            "lookup",
            |e: &&str| *e == "missing",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("forbidden")
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Aborted("forbidden"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
