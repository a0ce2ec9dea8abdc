//! Distributed-in-process token-bucket rate limiting, keyed by logical
//! service (e.g. `"stage1"`, `"stage2"`).
//!
//! Each service owns two coupled buckets — a request bucket and a token
//! bucket — consulted atomically so an `acquire` only succeeds when both
//! have sufficient capacity. Waiters are served first-come-first-served via
//! a per-service ticket counter.

mod bucket;

pub use bucket::TokenBucket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::error::{ErrorKind, PipelineError};
use crate::models::{RateAccountingRecord, RateLimiterSnapshot};

/// Static configuration for one logical service's dual buckets.
#[derive(Debug, Clone, Copy)]
pub struct ServiceLimitConfig {
    pub requests_per_minute: f64,
    pub tokens_per_minute: f64,
    /// Burst capacity in requests; the token bucket's capacity is
    /// `burst * avg_tokens_per_call`.
    pub burst: f64,
    pub avg_tokens_per_call: f64,
    /// Applied to the published quotas so the limiter never drives the
    /// provider to a hard denial. Default 0.8.
    pub safety_factor: f64,
}

impl ServiceLimitConfig {
    fn request_bucket(&self) -> TokenBucket {
        TokenBucket::new(self.burst, self.requests_per_minute * self.safety_factor / 60.0)
    }

    fn token_bucket(&self) -> TokenBucket {
        let capacity = self.burst * self.avg_tokens_per_call;
        TokenBucket::new(capacity, self.tokens_per_minute * self.safety_factor / 60.0)
    }
}

struct ServiceState {
    requests: TokenBucket,
    tokens: TokenBucket,
    next_ticket: u64,
    now_serving: u64,
    total_requests_granted: u64,
    total_tokens_granted: u64,
    window_start: chrono::DateTime<Utc>,
}

struct Service {
    state: Mutex<ServiceState>,
    notify: Notify,
}

pub struct RateLimiter {
    configs: HashMap<String, ServiceLimitConfig>,
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl RateLimiter {
    pub fn new(configs: HashMap<String, ServiceLimitConfig>) -> Self {
        Self {
            configs,
            services: RwLock::new(HashMap::new()),
        }
    }

    async fn service(&self, name: &str) -> Result<Arc<Service>, PipelineError> {
        if let Some(svc) = self.services.read().await.get(name) {
            return Ok(svc.clone());
        }
        let config = *self
            .configs
            .get(name)
            .ok_or_else(|| PipelineError::internal(format!("no rate limit config for service '{name}'")))?;

        let mut services = self.services.write().await;
        if let Some(svc) = services.get(name) {
            return Ok(svc.clone());
        }
        let svc = Arc::new(Service {
            state: Mutex::new(ServiceState {
                requests: config.request_bucket(),
                tokens: config.token_bucket(),
                next_ticket: 0,
                now_serving: 0,
                total_requests_granted: 0,
                total_tokens_granted: 0,
                window_start: Utc::now(),
            }),
            notify: Notify::new(),
        });
        services.insert(name.to_string(), svc.clone());
        Ok(svc)
    }

    /// `acquire(tokens_estimate, timeout) -> granted | timeout`. Suspends the
    /// caller until both buckets have capacity, or the timeout expires.
    pub async fn acquire(&self, service_name: &str, tokens_estimate: f64, timeout: Duration) -> Result<(), PipelineError> {
        let svc = self.service(service_name).await?;
        let ticket = {
            let mut state = svc.state.lock().await;
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            ticket
        };

        let deadline = Instant::now() + timeout;
        loop {
            let wait_hint = {
                let mut state = svc.state.lock().await;
                if state.now_serving == ticket {
                    let now = Instant::now();
                    if state.requests.available(now) >= 1.0 && state.tokens.available(now) >= tokens_estimate {
                        state.requests.try_take(1.0, now);
                        state.tokens.try_take(tokens_estimate, now);
                        state.now_serving += 1;
                        state.total_requests_granted += 1;
                        state.total_tokens_granted += tokens_estimate as u64;
                        svc.notify.notify_waiters();
                        return Ok(());
                    }
                    state
                        .requests
                        .wait_time(1.0, now)
                        .max(state.tokens.wait_time(tokens_estimate, now))
                } else {
                    Duration::from_millis(50)
                }
            };

            let now = Instant::now();
            if now >= deadline {
                // Relinquish the ticket slot so a timed-out waiter does not
                // permanently block the service's serving order.
                let mut state = svc.state.lock().await;
                if state.now_serving == ticket {
                    state.now_serving += 1;
                    svc.notify.notify_waiters();
                }
                return Err(PipelineError::new(ErrorKind::RateLimited { retry_after: None }, "rate limit acquire timed out"));
            }

            let remaining = deadline.saturating_duration_since(now);
            let sleep_for = wait_hint.min(remaining).max(Duration::from_millis(1));
            tokio::select! {
                _ = svc.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// `reconcile(actual_tokens)`: adjust the token bucket if the estimate
    /// used at `acquire` time was materially off.
    pub async fn reconcile(&self, service_name: &str, estimated_tokens: f64, actual_tokens: f64) -> Result<(), PipelineError> {
        let svc = self.service(service_name).await?;
        let mut state = svc.state.lock().await;
        if actual_tokens > estimated_tokens {
            state.tokens.debit_extra(actual_tokens - estimated_tokens);
        } else if actual_tokens < estimated_tokens {
            state.tokens.refund(estimated_tokens - actual_tokens);
        }
        Ok(())
    }

    /// `snapshot() -> {tokens_available, requests_available, refill_rate}`.
    pub async fn snapshot(&self, service_name: &str) -> Result<RateLimiterSnapshot, PipelineError> {
        let svc = self.service(service_name).await?;
        let state = svc.state.lock().await;
        let now = Instant::now();
        Ok(RateLimiterSnapshot {
            tokens_available: state.tokens.available(now),
            requests_available: state.requests.available(now),
            refill_tokens_per_sec: state.tokens.refill_per_sec(),
            refill_requests_per_sec: state.requests.refill_per_sec(),
        })
    }

    pub async fn accounting_record(&self, service_name: &str) -> Result<RateAccountingRecord, PipelineError> {
        let svc = self.service(service_name).await?;
        let state = svc.state.lock().await;
        Ok(RateAccountingRecord {
            service: service_name.to_string(),
            window_start: state.window_start,
            requests: state.total_requests_granted,
            tokens: state.total_tokens_granted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HashMap<String, ServiceLimitConfig> {
        let mut m = HashMap::new();
        m.insert(
            "stage1".to_string(),
            ServiceLimitConfig {
                requests_per_minute: 600.0,
                tokens_per_minute: 60_000.0,
                burst: 5.0,
                avg_tokens_per_call: 500.0,
                safety_factor: 1.0,
            },
        );
        m
    }

    #[tokio::test]
    async fn acquire_grants_within_burst_capacity() {
        let limiter = RateLimiter::new(config());
        for _ in 0..5 {
            limiter
                .acquire("stage1", 100.0, Duration::from_secs(1))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn acquire_unknown_service_is_internal_error() {
        let limiter = RateLimiter::new(config());
        let err = limiter.acquire("unknown", 1.0, Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let mut configs = config();
        configs.get_mut("stage1").unwrap().burst = 1.0;
        let limiter = RateLimiter::new(configs);

        limiter.acquire("stage1", 1.0, Duration::from_secs(1)).await.unwrap();
        let err = limiter
            .acquire("stage1", 500.0, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited { retry_after: None });
    }

    #[tokio::test]
    async fn reconcile_adjusts_token_bucket_for_undercount() {
        let limiter = RateLimiter::new(config());
        limiter.acquire("stage1", 100.0, Duration::from_secs(1)).await.unwrap();
        let before = limiter.snapshot("stage1").await.unwrap().tokens_available;
        limiter.reconcile("stage1", 100.0, 300.0).await.unwrap();
        let after = limiter.snapshot("stage1").await.unwrap().tokens_available;
        assert!(after < before);
    }

    #[tokio::test]
    async fn concurrent_acquires_are_all_eventually_granted_fifo() {
        let limiter = Arc::new(RateLimiter::new(config()));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire("stage1", 10.0, Duration::from_secs(2)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }
}
