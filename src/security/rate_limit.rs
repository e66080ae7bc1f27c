//! Fixed-window rate limiting with a shared store and a local fallback.
//!
//! # Data Flow
//! ```text
//! check_rate_limit(key, window_ms, max)
//!     → circuit closed?  SharedStoreLimiter (CounterStore, one counter per window)
//!         → store error / timeout: record failure, fall through
//!     → LocalFallbackLimiter (DashMap of windows, same keys and boundaries)
//! ```
//!
//! # Design Decisions
//! - Windows are aligned to multiples of `window_ms` since the epoch, so every
//!   instance and both strategies agree on boundaries
//! - Counters never exceed the quota; refused requests are not counted
//! - Degraded mode is a gauge and a snapshot field, never a client error

use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use crate::config::schema::{GatewayConfig, StoreBackend};
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::security::clock::Clock;
use crate::store::{CounterStore, StoreError};

/// Outcome of one rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u64,
    /// End of the current window in epoch ms.
    pub reset_at_ms: u64,
    pub limit: u64,
    pub limit_key: String,
}

impl RateLimitDecision {
    fn from_count(key: &str, count: u64, acquired: bool, max: u64, reset_at_ms: u64) -> Self {
        Self {
            allowed: acquired,
            remaining: if acquired { max.saturating_sub(count) } else { 0 },
            reset_at_ms,
            limit: max,
            limit_key: key.to_string(),
        }
    }

    /// Whole seconds until the window resets, at least 1.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1)
    }
}

/// Index of the window containing `now_ms` and the instant it ends.
pub fn window_bounds(now_ms: u64, window_ms: u64) -> (u64, u64) {
    let window_ms = window_ms.max(1);
    let index = now_ms / window_ms;
    (index, index.saturating_add(1).saturating_mul(window_ms))
}

/// Limit key for a source on a route.
pub fn limit_key(ip: IpAddr, route: &str) -> String {
    format!("{}:{}", ip, route)
}

/// A way of counting requests per key and window.
#[async_trait]
pub trait LimitStrategy: Send + Sync + Debug {
    async fn acquire(
        &self,
        key: &str,
        window_ms: u64,
        max: u64,
        now_ms: u64,
    ) -> Result<RateLimitDecision, StoreError>;

    /// Connectivity check; local strategies are always available.
    async fn probe(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Strategy backed by a shared [`CounterStore`].
#[derive(Debug)]
pub struct SharedStoreLimiter {
    store: Arc<dyn CounterStore>,
    prefix: String,
}

impl SharedStoreLimiter {
    pub fn new(store: Arc<dyn CounterStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn store_key(&self, key: &str, window_index: u64) -> String {
        format!("{}:{}:{}", self.prefix, key, window_index)
    }
}

#[async_trait]
impl LimitStrategy for SharedStoreLimiter {
    async fn acquire(
        &self,
        key: &str,
        window_ms: u64,
        max: u64,
        now_ms: u64,
    ) -> Result<RateLimitDecision, StoreError> {
        let (index, reset_at_ms) = window_bounds(now_ms, window_ms);
        let result = self
            .store
            .acquire(&self.store_key(key, index), max, window_ms.max(1))
            .await?;
        Ok(RateLimitDecision::from_count(
            key,
            result.count,
            result.acquired,
            max,
            reset_at_ms,
        ))
    }

    async fn probe(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    fn name(&self) -> &'static str {
        self.store.name()
    }
}

/// One counting window of the local limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    pub window_index: u64,
    pub window_ms: u64,
    pub count: u64,
}

impl FixedWindow {
    fn ends_at(&self) -> u64 {
        self.window_index
            .saturating_add(1)
            .saturating_mul(self.window_ms)
    }
}

/// Local window table, shared through the security state.
pub type LocalWindows = DashMap<String, FixedWindow>;

/// In-process fixed-window limiter.
#[derive(Debug)]
pub struct LocalFallbackLimiter {
    windows: Arc<LocalWindows>,
    max_keys: usize,
}

impl LocalFallbackLimiter {
    pub fn new(windows: Arc<LocalWindows>, max_keys: usize) -> Self {
        Self {
            windows,
            max_keys: max_keys.max(1),
        }
    }

    /// Count one request for `key` if it is within quota.
    pub fn acquire_local(&self, key: &str, window_ms: u64, max: u64, now_ms: u64) -> RateLimitDecision {
        let window_ms = window_ms.max(1);
        let (index, reset_at_ms) = window_bounds(now_ms, window_ms);

        if !self.windows.contains_key(key) {
            self.make_room(now_ms);
        }

        let mut window = self.windows.entry(key.to_string()).or_insert(FixedWindow {
            window_index: index,
            window_ms,
            count: 0,
        });
        if window.window_index != index || window.window_ms != window_ms {
            *window = FixedWindow {
                window_index: index,
                window_ms,
                count: 0,
            };
        }
        let acquired = window.count < max;
        if acquired {
            window.count += 1;
        }
        RateLimitDecision::from_count(key, window.count, acquired, max, reset_at_ms)
    }

    /// Current standing of `key` without counting a request.
    pub fn peek(&self, key: &str, window_ms: u64, max: u64, now_ms: u64) -> RateLimitDecision {
        let window_ms = window_ms.max(1);
        let (index, reset_at_ms) = window_bounds(now_ms, window_ms);
        let count = self
            .windows
            .get(key)
            .filter(|w| w.window_index == index && w.window_ms == window_ms)
            .map_or(0, |w| w.count);
        RateLimitDecision {
            allowed: count < max,
            remaining: max.saturating_sub(count),
            reset_at_ms,
            limit: max,
            limit_key: key.to_string(),
        }
    }

    /// Remove windows that have ended. Returns the number removed.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| window.ends_at() > now_ms);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    fn make_room(&self, now_ms: u64) {
        if self.windows.len() < self.max_keys {
            return;
        }
        self.sweep(now_ms);
        while self.windows.len() >= self.max_keys {
            let oldest = self
                .windows
                .iter()
                .min_by_key(|w| w.ends_at())
                .map(|w| w.key().clone());
            match oldest {
                Some(key) => {
                    self.windows.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl LimitStrategy for LocalFallbackLimiter {
    async fn acquire(
        &self,
        key: &str,
        window_ms: u64,
        max: u64,
        now_ms: u64,
    ) -> Result<RateLimitDecision, StoreError> {
        Ok(self.acquire_local(key, window_ms, max, now_ms))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Which path the limiter is currently using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterMode {
    /// Single-node mode, no shared store configured.
    Local,
    Shared,
    /// Shared store configured but unavailable.
    Fallback,
}

/// Per-key quotas, shared store first with a local fallback.
#[derive(Debug)]
pub struct RateLimiter {
    primary: Option<Arc<dyn LimitStrategy>>,
    fallback: Arc<LocalFallbackLimiter>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    degraded: AtomicBool,
}

impl RateLimiter {
    pub fn new(
        primary: Option<Arc<dyn LimitStrategy>>,
        fallback: Arc<LocalFallbackLimiter>,
        breaker_config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            primary,
            fallback,
            breaker: CircuitBreaker::new(breaker_config, clock.clone()),
            clock,
            degraded: AtomicBool::new(false),
        }
    }

    /// Build a limiter from config. A Redis backend gets a lazily connected
    /// store; if even that fails the limiter starts on its fallback.
    pub fn from_config(config: &GatewayConfig, windows: Arc<LocalWindows>, clock: Arc<dyn Clock>) -> Self {
        let fallback = Arc::new(LocalFallbackLimiter::new(
            windows,
            config.rate_limit.max_tracked_keys,
        ));
        let primary: Option<Arc<dyn LimitStrategy>> = match config.store.backend {
            StoreBackend::Memory => None,
            StoreBackend::Redis => match crate::store::RedisCounterStore::connect(&config.store) {
                Ok(store) => Some(Arc::new(SharedStoreLimiter::new(
                    Arc::new(store),
                    config.store.key_prefix.clone(),
                ))),
                Err(e) => {
                    tracing::error!(error = %e, "Counter store unavailable, using local rate limiting");
                    metrics::record_store_failure("connect");
                    None
                }
            },
        };
        Self::new(
            primary,
            fallback,
            CircuitBreakerConfig::from_store(&config.store),
            clock,
        )
    }

    /// Count one request for `key` against `max_requests` per `window_ms`.
    pub async fn check_rate_limit(&self, key: &str, window_ms: u64, max_requests: u64) -> RateLimitDecision {
        let now = self.clock.now_ms();

        if let Some(primary) = &self.primary {
            // The permit records a failure if this future is dropped mid-call.
            if let Some(permit) = self.breaker.try_call() {
                match primary.acquire(key, window_ms, max_requests, now).await {
                    Ok(decision) => {
                        permit.succeed();
                        self.set_degraded(false);
                        return decision;
                    }
                    Err(e) => {
                        permit.fail();
                        metrics::record_store_failure(store_error_kind(&e));
                        tracing::warn!(
                            store = primary.name(),
                            error = %e,
                            "Counter store failed, using local fallback"
                        );
                    }
                }
            }
            self.set_degraded(true);
        }

        self.fallback.acquire_local(key, window_ms, max_requests, now)
    }

    /// Standing of `key` without counting, from the local table.
    pub fn peek(&self, key: &str, window_ms: u64, max_requests: u64) -> RateLimitDecision {
        self.fallback
            .peek(key, window_ms, max_requests, self.clock.now_ms())
    }

    /// Ping the shared store, if any.
    pub async fn probe(&self) -> Result<(), StoreError> {
        match &self.primary {
            Some(primary) => primary.probe().await,
            None => Ok(()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> LimiterMode {
        match &self.primary {
            None => LimiterMode::Local,
            Some(_) if self.is_degraded() => LimiterMode::Fallback,
            Some(_) => LimiterMode::Shared,
        }
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.primary.as_ref().map(|_| self.breaker.state())
    }

    pub fn backend_name(&self) -> &'static str {
        self.primary
            .as_ref()
            .map_or(self.fallback.name(), |p| p.name())
    }

    pub fn sweep(&self, now_ms: u64) -> usize {
        self.fallback.sweep(now_ms)
    }

    fn set_degraded(&self, degraded: bool) {
        let was = self.degraded.swap(degraded, Ordering::AcqRel);
        if was != degraded {
            metrics::record_rate_limit_degraded(degraded);
            if degraded {
                tracing::warn!("Rate limiter entered degraded mode");
            } else {
                tracing::info!("Rate limiter left degraded mode");
            }
        }
    }
}

fn store_error_kind(error: &StoreError) -> &'static str {
    match error {
        StoreError::Connection(_) => "connection",
        StoreError::Command(_) => "command",
        StoreError::Timeout(_) => "timeout",
        StoreError::CircuitOpen => "circuit_open",
    }
}
