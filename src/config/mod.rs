//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse, deserialize, environment overrides)
//!     → validation.rs (semantic checks, all errors at once)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc to the gateway
//!
//! On change (file watcher or SIGHUP):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → new SecurityGateway built around the existing SecurityState
//!     → atomic swap through ArcSwap
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - `[security]` thresholds are required; everything else has defaults
//! - Secrets come from the environment and are never serialized
//! - An invalid reload is logged and ignored

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::GatewayConfig;
pub use schema::SecurityConfig;
