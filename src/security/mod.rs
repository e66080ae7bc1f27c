//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming delivery (SecurityRequestContext, headers via HeaderNormalizer):
//!     → inspector.rs (size, structure, header injection, patterns)
//!     → reputation.rs (is the source blocked?)
//!     → rate_limit.rs (per source and route quota, shared store or fallback)
//!     → signature.rs (HMAC over the raw body)
//!     → replay.rs (fresh timestamp, unseen fingerprint)
//!     → gateway.rs (decision, reputation feedback, counters)
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any security check failure
//! - No trust in client input; forwarding headers only from trusted proxies
//! - All mutable tables live in an explicit `SecurityState`
//! - Time is injected through `Clock`

pub mod clock;
pub mod context;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod inspector;
pub mod maintenance;
pub mod rate_limit;
pub mod replay;
pub mod reputation;
pub mod signature;
pub mod state;

pub use context::SecurityRequestContext;
pub use error::SecurityError;
pub use gateway::{GatewayDecision, GatewayHandle, SecurityGateway};
pub use state::SecurityState;
