//! Webhook Security Gateway Library
//!
//! Authenticates, rate-limits and defends inbound commerce webhooks before
//! they reach the storefront.

pub mod admin;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;
pub mod store;

pub use config::schema::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use security::{GatewayDecision, SecurityGateway, SecurityState};
