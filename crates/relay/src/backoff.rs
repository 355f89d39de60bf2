//! Bounded retry with exponential backoff and jitter.
//!
//! Every external-platform call in the relay runs through
//! [`retry_with_backoff`] so rate limits and transient failures are absorbed
//! locally before the caller decides whether to surface a retryable error.

use std::{future::Future, time::Duration};

use {rand::Rng, tracing::debug};

/// Classification hooks consulted between attempts. Implemented by error
/// types that know which of their variants are worth retrying.
pub trait Retryable {
    /// Whether another attempt may succeed. Defaults to always retryable.
    fn is_retryable(&self) -> bool {
        true
    }

    /// Server-supplied wait hint. When present it replaces the computed
    /// exponential delay.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Retry configuration. `attempts` counts invocations, not re-invocations;
/// an operation under the default policy runs at most three times.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Symmetric jitter fraction: the delay is scaled by a uniform sample
    /// from `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following 1-based attempt number `attempt`.
    /// `jitter_sample` must lie in `[-1, 1]`.
    fn delay_after(&self, attempt: u32, hint: Option<Duration>, jitter_sample: f64) -> Duration {
        let base_ms = match hint {
            // A server hint is taken verbatim, not clamped to max_delay.
            Some(hint) => hint.as_millis() as f64,
            None => {
                let exponential =
                    self.base_delay.as_millis() as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
                exponential.min(self.max_delay.as_millis() as f64)
            },
        };
        let jittered = base_ms * (1.0 + jitter_sample * self.jitter);
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Run `op` until it succeeds, the error is non-retryable, or the attempt
/// budget is spent. The final error is propagated unchanged; a success is
/// returned immediately and never retried.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || attempt >= policy.attempts {
                    return Err(err);
                }
                let sample = rand::rng().random_range(-1.0..=1.0);
                let delay = policy.delay_after(attempt, err.retry_after(), sample);
                debug!(
                    attempt,
                    max_attempts = policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, backing off before retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
    };

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
        retry_after: Option<Duration>,
    }

    impl TestError {
        fn retryable() -> Self {
            Self {
                retryable: true,
                retry_after: None,
            }
        }

        fn fatal() -> Self {
            Self {
                retryable: false,
                retry_after: None,
            }
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }

        fn retry_after(&self) -> Option<Duration> {
            self.retry_after
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = policy();
        assert_eq!(
            policy.delay_after(1, None, 0.0),
            Duration::from_millis(500)
        );
        assert_eq!(
            policy.delay_after(2, None, 0.0),
            Duration::from_millis(1000)
        );
        assert_eq!(
            policy.delay_after(3, None, 0.0),
            Duration::from_millis(2000)
        );
        // 500 * 2^4 would be 8000; capped at max_delay.
        assert_eq!(policy.delay_after(5, None, 0.0), Duration::from_secs(4));
    }

    #[test]
    fn server_hint_overrides_exponential_delay() {
        let policy = policy();
        // Hint is used verbatim, even above max_delay.
        assert_eq!(
            policy.delay_after(1, Some(Duration::from_secs(30)), 0.0),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn jitter_is_symmetric_and_clamped() {
        let policy = policy();
        assert_eq!(
            policy.delay_after(1, None, 1.0),
            Duration::from_millis(600)
        );
        assert_eq!(
            policy.delay_after(1, None, -1.0),
            Duration::from_millis(400)
        );
        let wild = RetryPolicy {
            jitter: 2.0,
            ..policy
        };
        // A jitter fraction above 1 could go negative; clamp at zero.
        assert_eq!(wild.delay_after(1, None, -1.0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn permanently_failing_op_runs_exactly_attempts_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let result: Result<(), TestError> = retry_with_backoff(&policy(), move || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err(TestError::retryable())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_aborts_after_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let result: Result<(), TestError> = retry_with_backoff(&policy(), move || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err(TestError::fatal())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_failure_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let result: Result<u32, TestError> = retry_with_backoff(&policy(), move || {
            let counted = Arc::clone(&counted);
            async move {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(TestError::retryable())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success_is_returned_without_delay() {
        let result: Result<&str, TestError> =
            retry_with_backoff(&policy(), || async { Ok("done") }).await;
        assert_eq!(result.unwrap(), "done");
    }
}
