//! Per-service circuit breaker: Closed / Open / HalfOpen state machine
//! guarding calls to a logical upstream service (e.g. `"stage1"`,
//! `"stage2"`). Admission checks are non-blocking; only the HalfOpen probe
//! slot is a bounded resource (a semaphore of size `max_probes`).

mod registry;

pub use registry::CircuitBreakerRegistry;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ErrorKind;
use crate::models::BreakerState;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Fraction of calls in the sliding window that must fail to trip.
    pub failure_ratio: f64,
    /// Minimum number of calls in the window before the ratio is evaluated,
    /// so a handful of early failures cannot trip the breaker.
    pub min_throughput: u32,
    /// Width of the sliding window used to evaluate failure_ratio.
    pub window: Duration,
    /// How long the breaker stays Open before admitting a HalfOpen probe.
    pub break_duration: Duration,
    /// How many probes may be in flight concurrently during HalfOpen.
    pub max_probes: usize,
    /// Cap applied when lengthening break_duration after a failed probe.
    pub max_break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            min_throughput: 10,
            window: Duration::from_secs(60),
            break_duration: Duration::from_secs(30),
            max_probes: 1,
            max_break_duration: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    phase: Phase,
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    current_break_duration: Duration,
}

impl Inner {
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&(t, _)) = self.window.front() {
            if now.duration_since(t) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failures_in_window(&self) -> u32 {
        self.window.iter().filter(|(_, ok)| !ok).count() as u32
    }

    fn successes_in_window(&self) -> u32 {
        self.window.iter().filter(|(_, ok)| *ok).count() as u32
    }
}

/// An admission permit. Dropping it releases the HalfOpen probe slot (if
/// one was held); Closed-state admissions hold no permit.
pub struct Permit(Option<OwnedSemaphorePermit>);

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failures_in_window: u32,
    pub successes_in_window: u32,
    pub opened_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    probes: std::sync::Arc<Semaphore>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            probes: std::sync::Arc::new(Semaphore::new(config.max_probes)),
            config,
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                window: VecDeque::new(),
                opened_at: None,
                current_break_duration: config.break_duration,
            }),
        }
    }

    /// `allow() -> permit | denied`. Non-blocking.
    pub fn allow(&self) -> Option<Permit> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.prune(self.config.window, now);

        match inner.phase {
            Phase::Closed => Some(Permit(None)),
            Phase::Open => {
                let elapsed = inner.opened_at.map(|t| now.duration_since(t)).unwrap_or_default();
                if elapsed >= inner.current_break_duration {
                    inner.phase = Phase::HalfOpen;
                    inner.window.clear();
                    drop(inner);
                    self.probes.clone().try_acquire_owned().ok().map(|p| Permit(Some(p)))
                } else {
                    None
                }
            }
            Phase::HalfOpen => {
                drop(inner);
                self.probes.clone().try_acquire_owned().ok().map(|p| Permit(Some(p)))
            }
        }
    }

    pub fn on_success(&self, _permit: &Permit) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.prune(self.config.window, now);
        inner.window.push_back((now, true));

        if inner.phase == Phase::HalfOpen {
            inner.phase = Phase::Closed;
            inner.opened_at = None;
            inner.current_break_duration = self.config.break_duration;
            inner.window.clear();
        }
    }

    /// Only failure kinds classified as "service" failures (not
    /// client/validation errors) count toward tripping.
    pub fn on_failure(&self, kind: &ErrorKind, _permit: &Permit) {
        if !kind.counts_toward_breaker() {
            return;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.prune(self.config.window, now);
        inner.window.push_back((now, false));

        match inner.phase {
            Phase::Closed => {
                let total = inner.window.len() as u32;
                let failures = inner.failures_in_window();
                if total >= self.config.min_throughput && (failures as f64 / total as f64) >= self.config.failure_ratio {
                    inner.phase = Phase::Open;
                    inner.opened_at = Some(now);
                }
            }
            Phase::HalfOpen => {
                inner.phase = Phase::Open;
                inner.opened_at = Some(now);
                inner.current_break_duration =
                    (inner.current_break_duration * 2).min(self.config.max_break_duration);
            }
            Phase::Open => {}
        }
    }

    pub fn state(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.prune(self.config.window, now);
        let state = match inner.phase {
            Phase::Closed => BreakerState::Closed,
            Phase::Open => BreakerState::Open,
            Phase::HalfOpen => BreakerState::HalfOpen,
        };
        let opened_at = inner.opened_at.map(|t| {
            chrono::Utc::now() - chrono::Duration::from_std(now.duration_since(t)).unwrap_or_default()
        });
        BreakerSnapshot {
            name: self.name.clone(),
            state,
            failures_in_window: inner.failures_in_window(),
            successes_in_window: inner.successes_in_window(),
            opened_at,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.phase = Phase::Closed;
        inner.window.clear();
        inner.opened_at = None;
        inner.current_break_duration = self.config.break_duration;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_ratio: 0.5,
            min_throughput: 4,
            window: Duration::from_secs(60),
            break_duration: Duration::from_millis(50),
            max_probes: 1,
            max_break_duration: Duration::from_secs(10),
        }
    }

    #[test]
    fn closed_allows_and_ignores_client_errors() {
        let breaker = CircuitBreaker::new("stage2", config());
        for _ in 0..10 {
            let permit = breaker.allow().unwrap();
            breaker.on_failure(&ErrorKind::AuthError, &permit);
        }
        assert_eq!(breaker.state().state, BreakerState::Closed);
    }

    #[test]
    fn trips_open_after_failure_ratio_exceeded() {
        let breaker = CircuitBreaker::new("stage2", config());
        for _ in 0..4 {
            let permit = breaker.allow().unwrap();
            breaker.on_failure(&ErrorKind::ServerError { status: 503 }, &permit);
        }
        assert_eq!(breaker.state().state, BreakerState::Open);
        assert!(breaker.allow().is_none());
    }

    #[test]
    fn half_open_probe_success_closes_breaker() {
        let breaker = CircuitBreaker::new("stage2", config());
        for _ in 0..4 {
            let permit = breaker.allow().unwrap();
            breaker.on_failure(&ErrorKind::ServerError { status: 503 }, &permit);
        }
        std::thread::sleep(Duration::from_millis(60));

        let permit = breaker.allow().expect("half-open probe admitted");
        breaker.on_success(&permit);
        assert_eq!(breaker.state().state, BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens_and_extends_break() {
        let breaker = CircuitBreaker::new("stage2", config());
        for _ in 0..4 {
            let permit = breaker.allow().unwrap();
            breaker.on_failure(&ErrorKind::ServerError { status: 503 }, &permit);
        }
        std::thread::sleep(Duration::from_millis(60));

        let permit = breaker.allow().expect("half-open probe admitted");
        breaker.on_failure(&ErrorKind::ServerError { status: 503 }, &permit);
        assert_eq!(breaker.state().state, BreakerState::Open);

        // Original break_duration (50ms) should no longer be sufficient since
        // it was doubled to 100ms.
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.allow().is_none());
    }

    #[test]
    fn half_open_caps_concurrent_probes_at_max_probes() {
        let breaker = CircuitBreaker::new("stage2", config());
        for _ in 0..4 {
            let permit = breaker.allow().unwrap();
            breaker.on_failure(&ErrorKind::ServerError { status: 503 }, &permit);
        }
        std::thread::sleep(Duration::from_millis(60));

        let first = breaker.allow();
        assert!(first.is_some());
        let second = breaker.allow();
        assert!(second.is_none());
    }
}
