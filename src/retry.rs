//! Bounded exponential-backoff retry for unreliable external I/O.
//!
//! Stage bodies call out to object stores, dataset sources and the training
//! sidecar over the network; those calls are wrapped in `execute_with_retry`
//! so transient failures get a bounded number of attempts before being
//! escalated. Sleeping between attempts blocks only the calling task, which
//! is acceptable because stage executions run as independent tasks and never
//! sit on a request path.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Error returned when an operation fails on every attempt.
///
/// Carries the operation name and target so the failure is diagnosable from
/// the log line alone, plus the final underlying error.
#[derive(Debug, Error)]
#[error("operation '{operation}' on '{target}' failed after {attempts} attempts: {source}")]
pub struct RetriesExhausted<E>
where
    E: std::error::Error + 'static,
{
    /// Name of the operation that was retried.
    pub operation: String,
    /// URL, storage ref or other target identifier.
    pub target: String,
    /// How many attempts were made.
    pub attempts: u32,
    /// The error from the final attempt.
    #[source]
    pub source: E,
}

/// Retry schedule: bounded attempts with geometric backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // One retry after a 1 second pause.
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given number of attempts and defaults
    /// for delay and multiplier.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Returns the delay to sleep after the given failed attempt (1-based).
    ///
    /// The sequence is `initial_delay * multiplier^(attempt - 1)`, uncapped:
    /// the attempt bound, not a delay ceiling, limits total wait.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        self.initial_delay.mul_f64(self.multiplier.powi(exponent))
    }
}

/// Runs `op` until it succeeds or the policy's attempts are exhausted.
///
/// Every error is treated as retryable; callers that need to fail fast on
/// validation errors must perform validation before entering the retry loop.
///
/// # Arguments
///
/// * `operation` - Short operation name for diagnostics (e.g. "download_dataset")
/// * `target` - What the operation acts on (URL, storage ref, slug)
/// * `policy` - The retry schedule
/// * `op` - The fallible operation, re-invoked on each attempt
///
/// # Errors
///
/// Returns `RetriesExhausted` wrapping the last error once all attempts fail.
pub async fn execute_with_retry<T, E, F, Fut>(
    operation: &str,
    target: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, RetriesExhausted<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);

    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = operation,
                    target = target,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(RetriesExhausted {
                    operation: operation.to_string(),
                    target: target.to_string(),
                    attempts: max_attempts,
                    source: err,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_initial_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delay_sequence_is_geometric() {
        let policy = RetryPolicy::new(4);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_sequence_with_unit_multiplier_is_flat() {
        let policy = RetryPolicy::new(3)
            .with_initial_delay(Duration::from_secs(2))
            .with_multiplier(1.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = Arc::clone(&calls);

        let result: Result<u32, RetriesExhausted<Boom>> =
            execute_with_retry("op", "target", &fast_policy(3), || {
                let calls = Arc::clone(&calls_in_op);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = Arc::clone(&calls);

        let result: Result<&str, RetriesExhausted<Boom>> =
            execute_with_retry("op", "target", &fast_policy(3), || {
                let calls = Arc::clone(&calls_in_op);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Boom)
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_attempts_exactly_max_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = Arc::clone(&calls);

        let result: Result<(), RetriesExhausted<Boom>> =
            execute_with_retry("download_dataset", "raw/x.tar.gz", &fast_policy(3), || {
                let calls = Arc::clone(&calls_in_op);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Boom)
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.operation, "download_dataset");
        assert_eq!(err.target, "raw/x.tar.gz");
        assert!(err.to_string().contains("download_dataset"));
        assert!(err.to_string().contains("raw/x.tar.gz"));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = Arc::clone(&calls);

        let result: Result<(), RetriesExhausted<Boom>> =
            execute_with_retry("op", "target", &fast_policy(0), || {
                let calls = Arc::clone(&calls_in_op);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Boom)
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
