//! Circuit breaker guarding the shared counter store.
//!
//! # States
//! - Closed: store calls pass through
//! - Open: store assumed down, callers go straight to the fallback
//! - Half-Open: a single probe call tests whether the store recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: after reset_timeout
//! Half-Open → Closed: success_threshold probe successes
//! Half-Open → Open: probe fails
//! ```
//!
//! # Design Decisions
//! - Lock-free: state lives in atomics, transitions use compare-and-swap
//! - Single probe in Half-Open (prevents hammering a recovering store)
//! - Calls go through a [`CallPermit`]; dropping one unresolved counts as a failure
//! - A half-open call older than reset_timeout may be taken over by a new caller
//! - Time comes from the injected clock so tests can step it

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::schema::StoreConfig;
use crate::security::clock::Clock;

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(val: u8) -> Self {
        match val {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Thresholds for [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u64,
    pub success_threshold: u64,
    pub reset_timeout_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn from_store(config: &StoreConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: 1,
            reset_timeout_ms: config.reset_timeout_ms,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            reset_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    opened_at_ms: AtomicU64,
    probe_in_flight: AtomicBool,
    probe_started_ms: AtomicU64,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            probe_started_ms: AtomicU64::new(0),
            config,
            clock,
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Permit for one protected call, or `None` while the circuit rejects calls.
    pub fn try_call(&self) -> Option<CallPermit<'_>> {
        self.allow_request().then(|| CallPermit {
            breaker: self,
            resolved: false,
        })
    }

    /// Whether the protected call should be attempted now.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                if self.clock.now_ms().saturating_sub(opened_at) < self.config.reset_timeout_ms {
                    return false;
                }
                let _ = self.state.compare_exchange(
                    CircuitState::Open as u8,
                    CircuitState::HalfOpen as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.success_count.store(0, Ordering::Release);
                self.try_probe()
            }
            CircuitState::HalfOpen => self.try_probe(),
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        if self.state() == CircuitState::HalfOpen {
            let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.state.store(CircuitState::Closed as u8, Ordering::Release);
                tracing::info!("Counter store recovered, circuit closed");
            }
        }
        self.probe_in_flight.store(false, Ordering::Release);
    }

    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::HalfOpen => self.open(),
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.open();
                }
            }
            CircuitState::Open => {}
        }
        self.probe_in_flight.store(false, Ordering::Release);
    }

    fn open(&self) {
        self.opened_at_ms.store(self.clock.now_ms(), Ordering::Release);
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        tracing::warn!(
            reset_timeout_ms = self.config.reset_timeout_ms,
            "Counter store circuit opened"
        );
    }

    fn try_probe(&self) -> bool {
        let now = self.clock.now_ms();
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.probe_started_ms.store(now, Ordering::Release);
            return true;
        }
        // A half-open caller that vanished without reporting must not wedge the circuit.
        let started = self.probe_started_ms.load(Ordering::Acquire);
        if now.saturating_sub(started) < self.config.reset_timeout_ms {
            return false;
        }
        let taken = self
            .probe_started_ms
            .compare_exchange(started, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if taken {
            tracing::debug!(stale_ms = now.saturating_sub(started), "Taking over stale half-open call");
        }
        taken
    }
}

/// One admitted call through a [`CircuitBreaker`].
///
/// Resolve it with [`succeed`](Self::succeed) or [`fail`](Self::fail). If the
/// call is cancelled first, dropping the permit records a failure.
#[must_use = "an unresolved permit counts as a failure"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    resolved: bool,
}

impl CallPermit<'_> {
    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::debug!("Protected call dropped before completing");
            self.breaker.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::clock::ManualClock;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                reset_timeout_ms: 1_000,
            },
            clock,
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = breaker(clock);
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = breaker(clock);
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_single_probe_then_close() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = breaker(clock.clone());
        cb.record_failure();
        cb.record_failure();

        clock.advance_ms(1_000);
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.allow_request(), "only one probe at a time");

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = breaker(clock.clone());
        cb.record_failure();
        cb.record_failure();

        clock.advance_ms(1_500);
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());

        clock.advance_ms(1_000);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_dropped_permit_releases_half_open_slot() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = breaker(clock.clone());
        cb.record_failure();
        cb.record_failure();

        clock.advance_ms(1_000);
        let permit = cb.try_call().expect("half-open call admitted");
        assert!(cb.try_call().is_none());
        drop(permit);
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance_ms(1_000);
        cb.try_call().expect("next half-open call admitted").succeed();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_dropped_permit_counts_as_failure_when_closed() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = breaker(clock);
        drop(cb.try_call());
        drop(cb.try_call());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_stale_half_open_call_taken_over() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = breaker(clock.clone());
        cb.record_failure();
        cb.record_failure();

        clock.advance_ms(1_000);
        // Caller admitted but never reports back.
        assert!(cb.allow_request());
        clock.advance_ms(999);
        assert!(!cb.allow_request());
        clock.advance_ms(1);
        assert!(cb.allow_request());
        assert!(!cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
