//! Retry executor: wraps a fallible async operation with bounded
//! exponential backoff, jitter, and error classification.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{AttemptRecord, ErrorKind, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Transient: network, 5xx, rate-limit, timeout. Retried until
    /// max_attempts.
    Retryable,
    /// Validation, 4xx except 429, breaker-open-under-policy. Propagates
    /// immediately.
    Terminal,
    /// Programmer error, quota-exhausted. Propagates immediately.
    Fatal,
}

/// Default classifier, built directly on `ErrorKind`'s own classification
/// methods.
pub fn classify_default(error: &PipelineError) -> Classification {
    if error.kind.is_fatal_for_batch() {
        Classification::Fatal
    } else if error.kind.is_retryable() {
        Classification::Retryable
    } else {
        Classification::Terminal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    None,
    /// Uniform random delay in `[0, computed_delay]`.
    Full,
    /// `computed_delay / 2 + uniform random in [0, computed_delay / 2]`.
    Equal,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: Jitter::Full,
        }
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `operation` until it succeeds, a non-retryable classification is
    /// reached, or `max_attempts` is exhausted. The classifier is given each
    /// error directly; the caller supplies it so this executor does not
    /// hardcode domain semantics about any one collaborator.
    pub async fn execute<T, Op, Fut, Cls>(&self, classify: Cls, mut operation: Op) -> Result<T, PipelineError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
        Cls: Fn(&PipelineError) -> Classification,
    {
        let mut attempts = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        kind: err.kind.clone(),
                        message: err.message.clone(),
                    });

                    match classify(&err) {
                        Classification::Terminal | Classification::Fatal => {
                            return Err(err.with_attempts(attempts));
                        }
                        Classification::Retryable => {
                            if attempt >= self.policy.max_attempts {
                                return Err(err.with_attempts(attempts));
                            }
                            let delay = self.compute_delay(attempt, &err);
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }

    /// Exponential backoff from `base_delay`, capped at `max_delay`, with
    /// jitter applied. A `RateLimited` error carrying `Retry-After`
    /// overrides the computed delay (taking whichever is longer).
    fn compute_delay(&self, attempt: u32, err: &PipelineError) -> Duration {
        let exp = self.policy.multiplier.powi(attempt as i32 - 1);
        let base_secs = self.policy.base_delay.as_secs_f64() * exp;
        let capped_secs = base_secs.min(self.policy.max_delay.as_secs_f64());

        let jittered_secs = match self.policy.jitter {
            Jitter::None => capped_secs,
            Jitter::Full => rand::thread_rng().gen_range(0.0..=capped_secs.max(0.0001)),
            Jitter::Equal => {
                let half = capped_secs / 2.0;
                half + rand::thread_rng().gen_range(0.0..=half.max(0.0001))
            }
        };

        let computed = Duration::from_secs_f64(jittered_secs.max(0.0));

        if let ErrorKind::RateLimited { retry_after: Some(retry_after) } = &err.kind {
            computed.max(*retry_after)
        } else {
            computed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: Jitter::None,
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry_on_first_success() {
        let executor = RetryExecutor::new(fast_policy());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result = executor
            .execute(classify_default, move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, PipelineError>(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let executor = RetryExecutor::new(fast_policy());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result = executor
            .execute(classify_default, move || {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(PipelineError::new(ErrorKind::Network, "connection reset"))
                    } else {
                        Ok(99)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_max_attempts_and_surfaces_attempt_history() {
        let executor = RetryExecutor::new(fast_policy());
        let err = executor
            .execute(classify_default, || async {
                Err::<(), _>(PipelineError::new(ErrorKind::Timeout, "timed out"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts.len(), 3);
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn terminal_error_propagates_immediately_without_retry() {
        let executor = RetryExecutor::new(fast_policy());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let err = executor
            .execute(classify_default, move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PipelineError::new(ErrorKind::AuthError, "bad key"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind, ErrorKind::AuthError);
    }

    #[tokio::test]
    async fn retry_after_overrides_computed_delay() {
        let executor = RetryExecutor::new(fast_policy());
        let start = std::time::Instant::now();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let _ = executor
            .execute(classify_default, move || {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err(PipelineError::new(
                            ErrorKind::RateLimited { retry_after: Some(Duration::from_millis(30)) },
                            "rate limited",
                        ))
                    } else {
                        Ok::<_, PipelineError>(())
                    }
                }
            })
            .await;

        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
