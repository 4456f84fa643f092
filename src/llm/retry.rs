//! Retry policy
//!
//! Pure error classification plus exponential backoff with jitter. Only
//! transient conditions (provider unavailable, rate limited, timeout) are
//! retried; everything else surfaces immediately. An upstream `Retry-After`
//! stretches the computed delay, never shortens it. Cancellation aborts the
//! loop without consuming retry budget.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::llm::{ErrorKind, LLMError, LLMResult};

/// Retry classes for the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Transient,
    RateLimited,
    Timeout,
    Auth,
    BadRequest,
    NonRetryable,
    Unknown,
}

impl RetryClass {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RetryClass::Transient | RetryClass::RateLimited | RetryClass::Timeout
        )
    }
}

/// Classify an error. Pure: the same error always yields the same class.
pub fn classify(error: &LLMError) -> RetryClass {
    match error.kind() {
        ErrorKind::ProviderUnavailable => RetryClass::Transient,
        ErrorKind::RateLimitExceeded => RetryClass::RateLimited,
        ErrorKind::Timeout => RetryClass::Timeout,
        ErrorKind::AuthFailed => RetryClass::Auth,
        ErrorKind::BadRequest | ErrorKind::ModelNotFound | ErrorKind::NotSupported => {
            RetryClass::BadRequest
        }
        // An open circuit must not burn retry budget.
        ErrorKind::CircuitOpen
        | ErrorKind::ContentFiltered
        | ErrorKind::BudgetExceeded
        | ErrorKind::ProviderNotFound
        | ErrorKind::RoutingLoop
        | ErrorKind::InternalError => RetryClass::NonRetryable,
        ErrorKind::UpstreamError => RetryClass::Unknown,
    }
}

/// Delay before retry number `attempt` (0-based): `base · 2^attempt` plus
/// jitter in `[0, base)`, floored at the upstream `Retry-After` when present.
pub fn backoff_delay(base: Duration, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let exponential = base.saturating_mul(1u32 << attempt.min(16));
    let jitter = Duration::from_secs_f64(
        rand::thread_rng().gen_range(0.0..base.as_secs_f64().max(f64::EPSILON)),
    );
    let computed = exponential + jitter;
    match retry_after {
        Some(hint) => computed.max(hint),
        None => computed,
    }
}

/// Retry loop configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_attempts: u32,
    pub base_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_interval: Duration) -> Self {
        Self {
            max_attempts,
            base_interval,
        }
    }

    /// Run `op` until it succeeds, a non-retryable error surfaces, the retry
    /// budget runs out, or `cancel` fires. The closure receives the 0-based
    /// attempt number.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> LLMResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = LLMResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = op(attempt).await;
            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            // A cancelled call is abandoned, not retried.
            if cancel.is_cancelled() {
                return Err(error);
            }

            let class = classify(&error);
            if !class.is_retryable() || attempt >= self.max_attempts {
                return Err(error);
            }

            let retry_after = match &error {
                LLMError::RateLimited { retry_after, .. } => *retry_after,
                _ => None,
            };
            let delay = backoff_delay(self.base_interval, attempt, retry_after);
            debug!(
                "retrying after {:?} (attempt {}/{}): {}",
                delay,
                attempt + 1,
                self.max_attempts,
                error
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(error),
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn unavailable() -> LLMError {
        LLMError::ProviderUnavailable {
            provider: "openai".into(),
            message: "502".into(),
        }
    }

    #[test]
    fn classification_is_pure_and_stable() {
        let err = unavailable();
        assert_eq!(classify(&err), RetryClass::Transient);
        assert_eq!(classify(&err), classify(&err));

        assert_eq!(
            classify(&LLMError::BadRequest("nope".into())),
            RetryClass::BadRequest
        );
        assert_eq!(
            classify(&LLMError::Timeout {
                provider: "x".into(),
                elapsed: Duration::from_secs(30)
            }),
            RetryClass::Timeout
        );
        assert_eq!(
            classify(&LLMError::CircuitOpen {
                provider: "x".into()
            }),
            RetryClass::NonRetryable
        );
        assert_eq!(
            classify(&LLMError::Auth {
                provider: "x".into(),
                message: "bad key".into()
            }),
            RetryClass::Auth
        );
    }

    #[test]
    fn only_transient_classes_retry() {
        assert!(RetryClass::Transient.is_retryable());
        assert!(RetryClass::RateLimited.is_retryable());
        assert!(RetryClass::Timeout.is_retryable());
        assert!(!RetryClass::Auth.is_retryable());
        assert!(!RetryClass::BadRequest.is_retryable());
        assert!(!RetryClass::NonRetryable.is_retryable());
        assert!(!RetryClass::Unknown.is_retryable());
    }

    #[test]
    fn backoff_grows_exponentially_with_bounded_jitter() {
        let base = Duration::from_millis(100);
        for attempt in 0..4u32 {
            let delay = backoff_delay(base, attempt, None);
            let floor = base * (1 << attempt);
            assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(delay < floor + base, "jitter exceeded base");
        }
    }

    #[test]
    fn retry_after_is_a_floor() {
        let base = Duration::from_millis(10);
        let hint = Duration::from_secs(5);
        let delay = backoff_delay(base, 0, Some(hint));
        assert!(delay >= hint);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = policy
            .execute(&CancellationToken::new(), move |_attempt| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(unavailable())
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_surfaces_immediately() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: LLMResult<()> = policy
            .execute(&CancellationToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(LLMError::BadRequest("malformed".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(LLMError::BadRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: LLMResult<()> = policy
            .execute(&CancellationToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(unavailable())
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(LLMError::ProviderUnavailable { .. })
        ));
        // Initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let policy = RetryPolicy::new(5, Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let trigger = cancel.clone();

        let result: LLMResult<()> = policy
            .execute(&cancel, move |_| {
                let counter = counter.clone();
                let trigger = trigger.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    trigger.cancel();
                    Err(unavailable())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry after cancel");
    }
}
