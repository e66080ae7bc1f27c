//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.
//! The `[security]` thresholds have no file-level defaults: a config that
//! omits them fails to load instead of running with guessed limits.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the webhook gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Core security thresholds.
    pub security: SecurityConfig,

    /// Header names and proxy trust.
    #[serde(default)]
    pub headers: HeaderConfig,

    /// Replay protection settings.
    #[serde(default)]
    pub replay: ReplayConfig,

    /// IP reputation and blocking settings.
    #[serde(default)]
    pub reputation: ReputationConfig,

    /// Rate limiting configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Shared counter store for rate limiting.
    #[serde(default)]
    pub store: StoreConfig,

    /// Background sweep settings.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Health derivation thresholds.
    #[serde(default)]
    pub health: HealthConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    #[serde(default)]
    pub admin: AdminConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            timeouts: TimeoutConfig::default(),
            security: SecurityConfig::default(),
            headers: HeaderConfig::default(),
            replay: ReplayConfig::default(),
            reputation: ReputationConfig::default(),
            rate_limit: RateLimitConfig::default(),
            store: StoreConfig::default(),
            maintenance: MaintenanceConfig::default(),
            health: HealthConfig::default(),
            observability: ObservabilityConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole-request timeout (including body upload) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Core security thresholds.
#[derive(Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Maximum accepted body size in bytes.
    pub max_payload_size: usize,

    /// Signature freshness window in seconds. Also the replay cache TTL.
    pub signature_timeout: u64,

    /// Failures within the reputation window before an address is blocked.
    pub max_failed_attempts: u32,

    /// Base block duration in seconds (doubled per repeat offense).
    pub block_duration: u64,

    /// Reject deliveries that did not arrive over HTTPS.
    pub require_https: bool,

    /// Enable nonce/timestamp replay protection.
    pub enable_replay_protection: bool,

    /// Shared HMAC secret. Usually supplied via `WEBHOOK_SECRET`.
    #[serde(default, skip_serializing)]
    pub webhook_secret: String,

    /// Previous secret accepted during rotation.
    #[serde(default, skip_serializing)]
    pub previous_secret: Option<String>,

    /// Maximum JSON nesting depth.
    #[serde(default = "default_max_json_depth")]
    pub max_json_depth: usize,

    /// Budget for one pipeline evaluation in milliseconds.
    #[serde(default = "default_processing_budget_ms")]
    pub processing_budget_ms: u64,
}

fn default_max_json_depth() -> usize {
    32
}

fn default_processing_budget_ms() -> u64 {
    250
}

impl SecurityConfig {
    pub fn signature_timeout_ms(&self) -> u64 {
        self.signature_timeout.saturating_mul(1000)
    }

    pub fn block_duration_ms(&self) -> u64 {
        self.block_duration.saturating_mul(1000)
    }

    pub fn processing_budget(&self) -> Duration {
        Duration::from_millis(self.processing_budget_ms)
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1024 * 1024, // 1MB
            signature_timeout: 300,
            max_failed_attempts: 5,
            block_duration: 60,
            require_https: false,
            enable_replay_protection: true,
            webhook_secret: String::new(),
            previous_secret: None,
            max_json_depth: default_max_json_depth(),
            processing_budget_ms: default_processing_budget_ms(),
        }
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("max_payload_size", &self.max_payload_size)
            .field("signature_timeout", &self.signature_timeout)
            .field("max_failed_attempts", &self.max_failed_attempts)
            .field("block_duration", &self.block_duration)
            .field("require_https", &self.require_https)
            .field("enable_replay_protection", &self.enable_replay_protection)
            .field("webhook_secret", &"<redacted>")
            .field("rotating", &self.previous_secret.is_some())
            .field("max_json_depth", &self.max_json_depth)
            .field("processing_budget_ms", &self.processing_budget_ms)
            .finish()
    }
}

/// Header names the gateway reads, and which peers may set forwarding headers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeaderConfig {
    pub signature: String,
    pub topic: String,
    pub timestamp: String,
    pub delivery_id: String,
    pub forwarded_for: String,
    pub forwarded_proto: String,

    /// Peers whose forwarding headers are honoured.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            signature: "x-webhook-signature".to_string(),
            topic: "x-webhook-topic".to_string(),
            timestamp: "x-webhook-timestamp".to_string(),
            delivery_id: "x-webhook-id".to_string(),
            forwarded_for: "x-forwarded-for".to_string(),
            forwarded_proto: "x-forwarded-proto".to_string(),
            trusted_proxies: vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
        }
    }
}

/// Replay protection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Maximum fingerprints held at once.
    pub max_entries: usize,

    /// Accepted distance between the delivery timestamp and local time.
    pub max_clock_skew_secs: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_clock_skew_secs: 300,
        }
    }
}

/// IP reputation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Rolling window in which failures accumulate.
    pub failure_window_secs: u64,

    /// Upper bound for a single block.
    pub max_block_duration_secs: u64,

    /// Quiet period after which repeat-offense history is forgotten.
    pub decay_after_secs: u64,

    /// Maximum addresses tracked at once.
    pub max_tracked_ips: usize,

    /// Addresses that are never blocked.
    pub allowlist: Vec<IpAddr>,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            failure_window_secs: 900,
            max_block_duration_secs: 86_400,
            decay_after_secs: 86_400,
            max_tracked_ips: 100_000,
            allowlist: Vec::new(),
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Fixed window length in milliseconds.
    pub window_ms: u64,

    /// Requests allowed per key per window.
    pub max_requests: u64,

    /// Maximum keys the in-memory limiter tracks.
    pub max_tracked_keys: usize,

    /// Per-route overrides keyed by route or topic.
    pub routes: HashMap<String, RouteLimit>,
}

impl RateLimitConfig {
    /// Window and quota that apply to `route`.
    pub fn limit_for(&self, route: &str) -> (u64, u64) {
        self.routes
            .get(route)
            .map(|r| (r.window_ms, r.max_requests))
            .unwrap_or((self.window_ms, self.max_requests))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            max_requests: 120,
            max_tracked_keys: 50_000,
            routes: HashMap::new(),
        }
    }
}

/// Override for one route.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteLimit {
    pub window_ms: u64,
    pub max_requests: u64,
}

/// Which counter store backs the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process counters only.
    Memory,
    /// Shared Redis counters with in-memory fallback.
    Redis,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Redis URL. Overridden by `REDIS_URL`.
    #[serde(skip_serializing)]
    pub redis_url: String,

    /// Prefix for every counter key.
    pub key_prefix: String,

    pub pool_size: u32,

    pub connect_timeout_ms: u64,

    /// Deadline for one store command before falling back.
    pub command_timeout_ms: u64,

    /// Consecutive store failures that open the circuit.
    pub failure_threshold: u64,

    /// Time the circuit stays open before probing the store again.
    pub reset_timeout_ms: u64,
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "webhook-gateway:rl".to_string(),
            pool_size: 16,
            connect_timeout_ms: 500,
            command_timeout_ms: 5,
            failure_threshold: 3,
            reset_timeout_ms: 5_000,
        }
    }
}

/// Background maintenance configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub sweep_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
        }
    }
}

/// Thresholds for the derived health status.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Blocked address count above which the gateway reports degraded.
    pub max_blocked_ips: usize,

    /// Fraction of replay capacity in use above which the gateway reports degraded.
    pub nonce_utilization_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_blocked_ips: 1_000,
            nonce_utilization_threshold: 0.9,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token). Overridden by `ADMIN_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

pub const PLACEHOLDER_API_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Validation refuses it when enabled.
            api_key: PLACEHOLDER_API_KEY.to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
