//! Shared counter store subsystem.
//!
//! # Data Flow
//! ```text
//! RateLimiter (SharedStoreLimiter)
//!     → CounterStore::acquire (conditional increment within a fixed window)
//!     → redis.rs (Lua script, pooled connection, per-command timeout)
//!
//! On error or timeout:
//!     → StoreError bubbles to the circuit breaker
//!     → RateLimiter switches to the in-memory fallback
//! ```
//!
//! # Design Decisions
//! - The store never lets a counter exceed the quota; a refused increment
//!   leaves it untouched
//! - Window keys embed the window index so every instance agrees on boundaries
//! - Store failures are recoverable and never reach the client

pub mod redis;

use async_trait::async_trait;
use thiserror::Error;

pub use self::redis::RedisCounterStore;

/// Errors from the shared counter store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("store command timed out after {0}ms")]
    Timeout(u64),

    #[error("store circuit open")]
    CircuitOpen,
}

/// Counter state after an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after the attempt, in `[0, max]`.
    pub count: u64,
    /// Whether this attempt was counted.
    pub acquired: bool,
}

/// A store offering atomic, quota-bounded counters with expiry.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Increment `key` if it is below `max`. A new key expires after `ttl_ms`.
    async fn acquire(&self, key: &str, max: u64, ttl_ms: u64) -> Result<WindowCount, StoreError>;

    /// Check connectivity without touching any counter.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;
}
