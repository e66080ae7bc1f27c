//! Process-wide security state.
//!
//! Everything that must outlive a configuration reload lives here: the replay
//! cache, the reputation table, the local rate windows and the outcome
//! counters. A reloaded gateway is built around the same `SecurityState`, so
//! blocks and remembered nonces survive the swap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::schema::GatewayConfig;
use crate::security::clock::Clock;
use crate::security::error::SecurityError;
use crate::security::rate_limit::LocalWindows;
use crate::security::replay::NonceCache;
use crate::security::reputation::ReputationTable;

/// Decision counters by outcome.
#[derive(Debug, Default)]
pub struct OutcomeCounters {
    allowed: AtomicU64,
    authentication: AtomicU64,
    replay: AtomicU64,
    payload: AtomicU64,
    rate_limited: AtomicU64,
    blocked: AtomicU64,
    timeout: AtomicU64,
}

/// Point-in-time copy of [`OutcomeCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeSnapshot {
    pub allowed: u64,
    pub authentication: u64,
    pub replay: u64,
    pub payload: u64,
    pub rate_limited: u64,
    pub blocked: u64,
    pub timeout: u64,
}

impl OutcomeCounters {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, error: &SecurityError) {
        let counter = match error {
            SecurityError::Authentication(_) => &self.authentication,
            SecurityError::Replay(_) => &self.replay,
            SecurityError::Payload(_) => &self.payload,
            SecurityError::RateLimitExceeded(_) => &self.rate_limited,
            SecurityError::SourceBlocked(_) => &self.blocked,
            SecurityError::Timeout(_) => &self.timeout,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OutcomeSnapshot {
        OutcomeSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            authentication: self.authentication.load(Ordering::Relaxed),
            replay: self.replay.load(Ordering::Relaxed),
            payload: self.payload.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.allowed,
            &self.authentication,
            &self.replay,
            &self.payload,
            &self.rate_limited,
            &self.blocked,
            &self.timeout,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Shared tables injected into every pipeline component.
#[derive(Debug)]
pub struct SecurityState {
    pub nonces: Arc<NonceCache>,
    pub reputation: Arc<ReputationTable>,
    pub windows: Arc<LocalWindows>,
    pub counters: OutcomeCounters,
    clock: Arc<dyn Clock>,
}

impl SecurityState {
    /// Replay capacity is fixed here; a reload does not resize the cache.
    pub fn new(config: &GatewayConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            nonces: Arc::new(NonceCache::new(config.replay.max_entries)),
            reputation: Arc::new(ReputationTable::new()),
            windows: Arc::new(LocalWindows::new()),
            counters: OutcomeCounters::default(),
            clock,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Drop all remembered state.
    pub fn clear(&self) {
        self.nonces.clear();
        self.reputation.clear();
        self.windows.clear();
        self.counters.reset();
        tracing::info!("Security state cleared");
    }
}
