//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Rate-limit check against the shared store:
//!     → circuit_breaker.rs (skip the store while it is known to be down)
//!     → store call under its command timeout
//!     → On failure: breaker records it, local fallback answers
//!
//! Repeat offender:
//!     → backoff.rs (deterministic doubling of block durations, capped)
//! ```
//!
//! # Design Decisions
//! - Every store call has a deadline
//! - No retries: a failed store call falls back immediately
//! - Circuit breaker prevents hammering a store that is down

pub mod backoff;
pub mod circuit_breaker;
