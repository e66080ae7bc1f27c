//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic and required fields)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Reject combinations that would silently weaken protection
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function: &GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system, at startup and on reload

use std::net::SocketAddr;

use axum::http::HeaderName;

use crate::config::schema::{GatewayConfig, StoreBackend, PLACEHOLDER_API_KEY};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Default)]
struct Errors(Vec<ValidationError>);

impl Errors {
    fn check(&mut self, ok: bool, field: &str, message: impl Into<String>) {
        if !ok {
            self.0.push(ValidationError {
                field: field.to_string(),
                message: message.into(),
            });
        }
    }

    fn socket_addr(&mut self, field: &str, value: &str) {
        self.check(
            value.parse::<SocketAddr>().is_ok(),
            field,
            format!("`{}` is not a socket address", value),
        );
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Errors::default();

    errors.socket_addr("listener.bind_address", &config.listener.bind_address);
    errors.check(config.timeouts.request_secs > 0, "timeouts.request_secs", "must be > 0");

    let security = &config.security;
    errors.check(security.max_payload_size > 0, "security.max_payload_size", "must be > 0");
    errors.check(security.signature_timeout > 0, "security.signature_timeout", "must be > 0");
    errors.check(security.max_failed_attempts > 0, "security.max_failed_attempts", "must be > 0");
    errors.check(security.block_duration > 0, "security.block_duration", "must be > 0");
    errors.check(
        !security.webhook_secret.is_empty(),
        "security.webhook_secret",
        "must be set (or provided via WEBHOOK_SECRET)",
    );
    errors.check(security.max_json_depth > 0, "security.max_json_depth", "must be > 0");
    errors.check(security.processing_budget_ms > 0, "security.processing_budget_ms", "must be > 0");

    for (field, name) in [
        ("headers.signature", &config.headers.signature),
        ("headers.topic", &config.headers.topic),
        ("headers.timestamp", &config.headers.timestamp),
        ("headers.delivery_id", &config.headers.delivery_id),
        ("headers.forwarded_for", &config.headers.forwarded_for),
        ("headers.forwarded_proto", &config.headers.forwarded_proto),
    ] {
        errors.check(
            HeaderName::from_bytes(name.as_bytes()).is_ok(),
            field,
            format!("`{}` is not a valid header name", name),
        );
    }

    errors.check(config.replay.max_entries > 0, "replay.max_entries", "must be > 0");
    errors.check(
        config.replay.max_clock_skew_secs <= security.signature_timeout,
        "replay.max_clock_skew_secs",
        "must not exceed security.signature_timeout, or replays could outlive their nonce",
    );

    let reputation = &config.reputation;
    errors.check(reputation.failure_window_secs > 0, "reputation.failure_window_secs", "must be > 0");
    errors.check(
        reputation.max_block_duration_secs >= security.block_duration,
        "reputation.max_block_duration_secs",
        "must be >= security.block_duration",
    );
    errors.check(reputation.max_tracked_ips > 0, "reputation.max_tracked_ips", "must be > 0");

    let rate_limit = &config.rate_limit;
    if rate_limit.enabled {
        errors.check(rate_limit.window_ms > 0, "rate_limit.window_ms", "must be > 0");
        errors.check(rate_limit.max_requests > 0, "rate_limit.max_requests", "must be > 0");
        errors.check(rate_limit.max_tracked_keys > 0, "rate_limit.max_tracked_keys", "must be > 0");
        for (route, limit) in &rate_limit.routes {
            let field = format!("rate_limit.routes.{}", route);
            errors.check(limit.window_ms > 0, &field, "window_ms must be > 0");
            errors.check(limit.max_requests > 0, &field, "max_requests must be > 0");
        }
    }

    let store = &config.store;
    if store.backend == StoreBackend::Redis {
        errors.check(
            store.redis_url.starts_with("redis://") || store.redis_url.starts_with("rediss://"),
            "store.redis_url",
            "must be a redis:// or rediss:// URL",
        );
        errors.check(store.pool_size > 0, "store.pool_size", "must be > 0");
        errors.check(store.command_timeout_ms > 0, "store.command_timeout_ms", "must be > 0");
        // Covers pool checkout too; a store call must fail before the request budget does.
        errors.check(
            store.command_timeout_ms < security.processing_budget_ms,
            "store.command_timeout_ms",
            "must be < security.processing_budget_ms",
        );
        errors.check(store.failure_threshold > 0, "store.failure_threshold", "must be > 0");
    }

    errors.check(
        config.maintenance.sweep_interval_secs > 0,
        "maintenance.sweep_interval_secs",
        "must be > 0",
    );
    let threshold = config.health.nonce_utilization_threshold;
    errors.check(
        threshold > 0.0 && threshold <= 1.0,
        "health.nonce_utilization_threshold",
        "must be in (0, 1]",
    );

    let observability = &config.observability;
    errors.check(
        LOG_LEVELS.contains(&observability.log_level.to_ascii_lowercase().as_str()),
        "observability.log_level",
        format!("must be one of {}", LOG_LEVELS.join(", ")),
    );
    if observability.metrics_enabled {
        errors.socket_addr("observability.metrics_address", &observability.metrics_address);
    }

    if config.admin.enabled {
        errors.socket_addr("admin.bind_address", &config.admin.bind_address);
        errors.check(
            !config.admin.api_key.is_empty() && config.admin.api_key != PLACEHOLDER_API_KEY,
            "admin.api_key",
            "must be changed from the placeholder (or provided via ADMIN_API_KEY)",
        );
    }

    if errors.0.is_empty() {
        Ok(())
    } else {
        Err(errors.0)
    }
}
