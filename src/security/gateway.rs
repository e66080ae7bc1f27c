//! The allow/deny pipeline and its administration surface.
//!
//! # Pipeline
//! ```text
//! PayloadInspector → IpReputationStore::is_blocked → RateLimiter
//!     → SignatureValidator → ReplayGuard → allow
//! ```
//!
//! The first failing stage decides the response and no later stage runs.
//! Authentication, replay and payload rejections are fed back to the
//! reputation store; rate-limit and blocked-source rejections are not, so a
//! blocked sender that keeps retrying does not extend its own block.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::config::schema::GatewayConfig;
use crate::observability::metrics;
use crate::resilience::circuit_breaker::CircuitState;
use crate::security::context::SecurityRequestContext;
use crate::security::error::SecurityError;
use crate::security::inspector::{InspectorPolicy, PayloadInspector};
use crate::security::rate_limit::{limit_key, LimiterMode, RateLimitDecision, RateLimiter};
use crate::security::replay::{ReplayGuard, ReplayRejection};
use crate::security::reputation::{IpReputationStore, ReputationPolicy};
use crate::security::signature::{SignatureReason, SignatureValidator};
use crate::security::state::{OutcomeSnapshot, SecurityState};

/// Hot-swappable gateway shared by the HTTP, admin and maintenance tasks.
pub type GatewayHandle = Arc<ArcSwap<SecurityGateway>>;

/// Address used for synthetic self-test deliveries (TEST-NET-1).
const SELF_TEST_SOURCE: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

/// Final verdict for one request.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayDecision {
    pub allowed: bool,
    pub status: u16,
    pub reason: &'static str,
    pub request_id: String,
    #[serde(skip)]
    pub rate_limit: Option<RateLimitDecision>,
    #[serde(skip)]
    pub retry_after_secs: Option<u64>,
    /// Low and medium findings that did not block the request.
    #[serde(skip)]
    pub findings: Vec<&'static str>,
}

/// What a passing pipeline run produced.
#[derive(Debug, Default)]
struct Passed {
    rate_limit: Option<RateLimitDecision>,
    findings: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub reasons: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub mode: LimiterMode,
    pub backend: &'static str,
    pub degraded: bool,
    pub circuit: Option<CircuitState>,
}

/// Read-only aggregate computed on demand.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityMetricsSnapshot {
    pub blocked_ip_count: usize,
    pub tracked_ip_count: usize,
    pub active_nonce_count: usize,
    pub nonce_capacity: usize,
    pub rate_limit: RateLimitStatus,
    pub outcomes: OutcomeSnapshot,
    pub health: HealthReport,
    /// Running configuration; secrets are never serialized.
    pub config: GatewayConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockedIp {
    pub ip: IpAddr,
    pub blocked_until_ms: u64,
    pub remaining_secs: u64,
    pub consecutive_blocks: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfTestReport {
    pub passed: bool,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub nonces: usize,
    pub rate_windows: usize,
    pub reputation_records: usize,
}

/// Orchestrates the security pipeline for one configuration generation.
#[derive(Debug)]
pub struct SecurityGateway {
    config: Arc<GatewayConfig>,
    state: Arc<SecurityState>,
    inspector: PayloadInspector,
    reputation: IpReputationStore,
    limiter: RateLimiter,
    signatures: SignatureValidator,
    replay: ReplayGuard,
}

impl SecurityGateway {
    pub fn new(config: Arc<GatewayConfig>, state: Arc<SecurityState>) -> Self {
        let limiter = RateLimiter::from_config(&config, state.windows.clone(), state.clock());
        Self::with_rate_limiter(config, state, limiter)
    }

    pub fn with_rate_limiter(
        config: Arc<GatewayConfig>,
        state: Arc<SecurityState>,
        limiter: RateLimiter,
    ) -> Self {
        let clock = state.clock();
        let security = &config.security;

        let signatures = SignatureValidator::new(
            security.webhook_secret.as_bytes().to_vec(),
            security.previous_secret.as_ref().map(|s| s.as_bytes().to_vec()),
        );
        let replay = ReplayGuard::new(
            state.nonces.clone(),
            clock.clone(),
            config.headers.clone(),
            security.enable_replay_protection,
            security.signature_timeout_ms(),
            config.replay.max_clock_skew_secs.saturating_mul(1000),
        );
        let reputation = IpReputationStore::new(
            state.reputation.clone(),
            clock,
            ReputationPolicy::from_config(&config),
        );

        Self {
            inspector: PayloadInspector::new(InspectorPolicy::from_config(&config)),
            reputation,
            limiter,
            signatures,
            replay,
            config,
            state,
        }
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn state(&self) -> &Arc<SecurityState> {
        &self.state
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn reputation(&self) -> &IpReputationStore {
        &self.reputation
    }

    /// Run the pipeline under the processing budget.
    pub async fn evaluate(&self, ctx: &SecurityRequestContext) -> GatewayDecision {
        let start = Instant::now();
        let budget_ms = self.config.security.processing_budget_ms;

        let outcome = match tokio::time::timeout(Duration::from_millis(budget_ms), self.run_pipeline(ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SecurityError::Timeout(budget_ms)),
        };

        match outcome {
            Ok(passed) => {
                self.state.counters.record_allowed();
                metrics::record_decision("allowed", "ok", start);
                if !passed.findings.is_empty() {
                    tracing::info!(
                        request_id = %ctx.request_id(),
                        source_ip = %ctx.source_ip(),
                        route = %ctx.route(),
                        findings = ?passed.findings,
                        "Delivery accepted with low-risk findings"
                    );
                } else {
                    tracing::debug!(
                        request_id = %ctx.request_id(),
                        source_ip = %ctx.source_ip(),
                        route = %ctx.route(),
                        "Delivery accepted"
                    );
                }
                GatewayDecision {
                    allowed: true,
                    status: 200,
                    reason: "ok",
                    request_id: ctx.request_id().to_string(),
                    rate_limit: passed.rate_limit,
                    retry_after_secs: None,
                    findings: passed.findings,
                }
            }
            Err(error) => self.reject(ctx, error, start),
        }
    }

    fn reject(&self, ctx: &SecurityRequestContext, error: SecurityError, start: Instant) -> GatewayDecision {
        if error.counts_as_failure() {
            self.reputation.record_failure(ctx.source_ip());
        }
        self.state.counters.record_rejected(&error);
        metrics::record_decision("rejected", error.reason_code(), start);
        tracing::warn!(
            request_id = %ctx.request_id(),
            source_ip = %ctx.source_ip(),
            route = %ctx.route(),
            stage = error.stage(),
            reason = error.reason_code(),
            "Delivery rejected"
        );

        let (rate_limit, retry_after_secs) = match &error {
            SecurityError::RateLimitExceeded(decision) => (
                Some(decision.clone()),
                Some(decision.retry_after_secs(self.state.clock().now_ms())),
            ),
            _ => (None, None),
        };

        GatewayDecision {
            allowed: false,
            status: error.status_code().as_u16(),
            reason: error.reason_code(),
            request_id: ctx.request_id().to_string(),
            rate_limit,
            retry_after_secs,
            findings: Vec::new(),
        }
    }

    async fn run_pipeline(&self, ctx: &SecurityRequestContext) -> Result<Passed, SecurityError> {
        let assessment = self.inspector.inspect(ctx);
        if assessment.is_rejected() {
            return Err(SecurityError::Payload(assessment));
        }
        let findings = assessment.reasons.iter().map(|r| r.code()).collect();

        let ip = ctx.source_ip();
        if self.reputation.is_blocked(ip) {
            return Err(SecurityError::SourceBlocked(ip));
        }

        let rate_limit = if self.config.rate_limit.enabled {
            let (window_ms, max_requests) = self.config.rate_limit.limit_for(ctx.route());
            let decision = self
                .limiter
                .check_rate_limit(&limit_key(ip, ctx.route()), window_ms, max_requests)
                .await;
            if !decision.allowed {
                return Err(SecurityError::RateLimitExceeded(decision));
            }
            Some(decision)
        } else {
            None
        };

        self.verify_signature(ctx)?;
        self.replay.accept(ctx).map_err(SecurityError::Replay)?;

        Ok(Passed {
            rate_limit,
            findings,
        })
    }

    fn verify_signature(&self, ctx: &SecurityRequestContext) -> Result<(), SecurityError> {
        let header = ctx
            .headers()
            .single(&self.config.headers.signature)
            .map_err(|_| SecurityError::Authentication(SignatureReason::MalformedHeader))?;
        let result = self.signatures.verify(ctx.body(), header);
        if result.valid {
            Ok(())
        } else {
            Err(SecurityError::Authentication(result.reason))
        }
    }

    // ---- Administration ----

    pub fn security_metrics(&self) -> SecurityMetricsSnapshot {
        let now = self.state.clock().now_ms();
        let blocked_ip_count = self.reputation.blocked_count();
        let active_nonce_count = self.state.nonces.active_count(now);
        metrics::record_state_sizes(blocked_ip_count, active_nonce_count);

        SecurityMetricsSnapshot {
            blocked_ip_count,
            tracked_ip_count: self.reputation.tracked_count(),
            active_nonce_count,
            nonce_capacity: self.state.nonces.capacity(),
            rate_limit: self.rate_limit_status(),
            outcomes: self.state.counters.snapshot(),
            health: self.health(),
            config: (*self.config).clone(),
        }
    }

    pub fn rate_limit_status(&self) -> RateLimitStatus {
        RateLimitStatus {
            mode: self.limiter.mode(),
            backend: self.limiter.backend_name(),
            degraded: self.limiter.is_degraded(),
            circuit: self.limiter.circuit_state(),
        }
    }

    pub fn blocked_ips(&self) -> Vec<BlockedIp> {
        let now = self.state.clock().now_ms();
        self.reputation
            .list_blocked()
            .into_iter()
            .map(|record| BlockedIp {
                ip: record.ip,
                blocked_until_ms: record.blocked_until_ms,
                remaining_secs: record.remaining_ms(now).div_ceil(1000),
                consecutive_blocks: record.consecutive_blocks,
            })
            .collect()
    }

    pub fn unblock_ip(&self, ip: IpAddr) -> bool {
        self.reputation.unblock(ip)
    }

    pub fn health(&self) -> HealthReport {
        let now = self.state.clock().now_ms();
        let mut reasons = Vec::new();

        if self.limiter.is_degraded() {
            reasons.push("rate_limiter_degraded");
        }
        let capacity = self.state.nonces.capacity() as f64;
        let utilization = self.state.nonces.active_count(now) as f64 / capacity;
        if utilization >= self.config.health.nonce_utilization_threshold {
            reasons.push("nonce_cache_near_capacity");
        }
        if self.reputation.blocked_count() > self.config.health.max_blocked_ips {
            reasons.push("too_many_blocked_ips");
        }

        HealthReport {
            status: if reasons.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            reasons,
        }
    }

    /// Dry run of every stage with a synthetic delivery. Reads shared state
    /// but never writes it.
    pub async fn test_security_configuration(&self) -> SelfTestReport {
        let now = self.state.clock().now_ms();
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let body = format!(r#"{{"event":"gateway.self_test","id":"{}"}}"#, delivery_id);
        let signature = self.signatures.sign(body.as_bytes());
        let headers = &self.config.headers;

        let synthetic = |body: String, timestamp_secs: u64| {
            SecurityRequestContext::builder(SELF_TEST_SOURCE, "self-test")
                .header("content-type", "application/json")
                .header(&headers.signature, &signature)
                .header(&headers.timestamp, &timestamp_secs.to_string())
                .header(&headers.delivery_id, &delivery_id)
                .body(body)
                .received_at_ms(now)
                .secure_transport(true)
                .request_id(format!("self-test-{}", delivery_id))
                .build()
        };
        let ctx = synthetic(body.clone(), now / 1000);

        let mut stages = Vec::with_capacity(5);

        let clean = self.inspector.inspect(&ctx);
        let hostile = self.inspector.inspect(&synthetic(
            r#"{"note":"<script>alert(1)</script>"}"#.to_string(),
            now / 1000,
        ));
        stages.push(StageReport {
            stage: "payload",
            passed: !clean.is_rejected() && hostile.is_rejected(),
            detail: format!(
                "clean delivery {:?}, hostile delivery {:?}",
                clean.level, hostile.level
            ),
        });

        stages.push(StageReport {
            stage: "reputation",
            passed: !self.reputation.peek_blocked(SELF_TEST_SOURCE),
            detail: format!("{} addresses blocked", self.reputation.blocked_count()),
        });

        let status = self.rate_limit_status();
        let (window_ms, max_requests) = self.config.rate_limit.limit_for(ctx.route());
        let standing = self
            .limiter
            .peek(&limit_key(SELF_TEST_SOURCE, ctx.route()), window_ms, max_requests);
        let probe = self.limiter.probe().await;
        stages.push(StageReport {
            stage: "rate_limit",
            passed: probe.is_ok() && standing.allowed,
            detail: match probe {
                Ok(()) => format!(
                    "{:?} limiter on {}, {} of {} remaining",
                    status.mode, status.backend, standing.remaining, max_requests
                ),
                Err(e) => format!("store probe failed, local fallback in use: {}", e),
            },
        });

        let secret_configured = !self.config.security.webhook_secret.is_empty();
        let valid = self.signatures.verify(ctx.body(), Some(&signature));
        let tampered = self
            .signatures
            .verify(format!("{} ", body).as_bytes(), Some(&signature));
        stages.push(StageReport {
            stage: "signature",
            passed: secret_configured && valid.valid && !tampered.valid,
            detail: if secret_configured {
                format!("signed delivery {}, tampered delivery {}", valid.reason, tampered.reason)
            } else {
                "no webhook secret configured".to_string()
            },
        });

        let replay_stage = if self.replay.enabled() {
            let fresh = self.replay.check(&ctx);
            let skew_secs = self.config.replay.max_clock_skew_secs;
            let stale = self
                .replay
                .check(&synthetic(body, (now / 1000).saturating_sub(skew_secs + 60)));
            StageReport {
                stage: "replay",
                passed: fresh.is_ok() && stale == Err(ReplayRejection::Stale),
                detail: format!(
                    "fresh delivery {}, stale delivery {}",
                    fresh.map_or_else(|e| e.to_string(), |()| "accepted".to_string()),
                    stale.map_or_else(|e| e.to_string(), |()| "accepted".to_string()),
                ),
            }
        } else {
            StageReport {
                stage: "replay",
                passed: true,
                detail: "replay protection disabled".to_string(),
            }
        };
        stages.push(replay_stage);

        let passed = stages.iter().all(|s| s.passed);
        tracing::info!(passed, "Security self-test completed");
        SelfTestReport { passed, stages }
    }

    /// Remove expired state. Best-effort; lookups never depend on it.
    pub fn sweep(&self) -> SweepReport {
        let now = self.state.clock().now_ms();
        let report = SweepReport {
            nonces: self.state.nonces.purge_expired(now),
            rate_windows: self.limiter.sweep(now),
            reputation_records: self.reputation.sweep(now),
        };
        metrics::record_state_sizes(
            self.reputation.blocked_count(),
            self.state.nonces.active_count(now),
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitBreakerConfig;
    use crate::security::clock::{Clock, ManualClock};
    use crate::security::rate_limit::{LimitStrategy, LocalFallbackLimiter};
    use crate::security::signature::sign;

    const START_MS: u64 = 1_700_000_000_000;
    const SECRET: &str = "s3cr3t";

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.security.webhook_secret = SECRET.to_string();
        config.security.max_failed_attempts = 3;
        config.security.block_duration = 60;
        config.rate_limit.window_ms = 1000;
        config.rate_limit.max_requests = 5;
        config
    }

    fn gateway(config: GatewayConfig) -> (SecurityGateway, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let state = Arc::new(SecurityState::new(&config, clock.clone()));
        (SecurityGateway::new(Arc::new(config), state), clock)
    }

    fn delivery(ip: &str, body: &str, signature: &str, now_ms: u64, id: &str) -> SecurityRequestContext {
        SecurityRequestContext::builder(ip.parse().unwrap(), "orders/create")
            .header("content-type", "application/json")
            .header("x-webhook-signature", signature)
            .header("x-webhook-timestamp", &(now_ms / 1000).to_string())
            .header("x-webhook-id", id)
            .body(body.to_string())
            .request_id(format!("req-{id}"))
            .build()
    }

    fn signed(ip: &str, body: &str, now_ms: u64, id: &str) -> SecurityRequestContext {
        delivery(ip, body, &sign(SECRET.as_bytes(), body.as_bytes()), now_ms, id)
    }

    #[tokio::test]
    async fn test_valid_delivery_allowed() {
        let (gw, _) = gateway(config());
        let decision = gw.evaluate(&signed("203.0.113.5", r#"{"a":1}"#, START_MS, "1")).await;
        assert!(decision.allowed);
        assert_eq!(decision.status, 200);
        assert_eq!(decision.request_id, "req-1");
        assert_eq!(decision.rate_limit.map(|r| r.remaining), Some(4));
    }

    /// Shared strategy whose store never answers.
    #[derive(Debug)]
    struct StalledStrategy;

    #[async_trait::async_trait]
    impl LimitStrategy for StalledStrategy {
        async fn acquire(
            &self,
            _key: &str,
            _window_ms: u64,
            _max: u64,
            _now_ms: u64,
        ) -> Result<RateLimitDecision, crate::store::StoreError> {
            std::future::pending().await
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_processing_budget_exceeded_is_503() {
        let mut config = config();
        config.security.processing_budget_ms = 20;
        let clock = Arc::new(ManualClock::new(START_MS));
        let state = Arc::new(SecurityState::new(&config, clock.clone()));
        let limiter = RateLimiter::new(
            Some(Arc::new(StalledStrategy)),
            Arc::new(LocalFallbackLimiter::new(state.windows.clone(), 100)),
            CircuitBreakerConfig::default(),
            clock,
        );
        let gw = SecurityGateway::with_rate_limiter(Arc::new(config), state, limiter);

        for id in ["1", "2", "3"] {
            let decision = gw.evaluate(&signed("203.0.113.5", "{}", START_MS, id)).await;
            assert!(!decision.allowed);
            assert_eq!(decision.status, 503);
            assert_eq!(decision.reason, "processing_timeout");
        }
        assert_eq!(gw.reputation().tracked_count(), 0);
        assert_eq!(gw.security_metrics().outcomes.timeout, 3);

        // Each cancelled store call counted against the breaker; the next
        // request goes straight to the local fallback.
        assert_eq!(gw.rate_limiter().circuit_state(), Some(CircuitState::Open));
        let decision = gw.evaluate(&signed("203.0.113.5", "{}", START_MS, "4")).await;
        assert!(decision.allowed);
        assert_eq!(gw.rate_limiter().mode(), LimiterMode::Fallback);
    }

    #[tokio::test]
    async fn test_truncated_signature_is_401() {
        let (gw, _) = gateway(config());
        let mut signature = sign(SECRET.as_bytes(), br#"{"a":1}"#);
        signature.pop();
        let decision = gw
            .evaluate(&delivery("203.0.113.5", r#"{"a":1}"#, &signature, START_MS, "1"))
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.status, 401);
        assert_eq!(decision.reason, "invalid_signature");
    }

    #[tokio::test]
    async fn test_replay_is_401() {
        let (gw, _) = gateway(config());
        let ctx = signed("203.0.113.5", r#"{"a":1}"#, START_MS, "1");
        assert!(gw.evaluate(&ctx).await.allowed);
        let again = gw.evaluate(&ctx).await;
        assert_eq!(again.status, 401);
        assert_eq!(again.reason, "replayed_request");
    }

    #[tokio::test]
    async fn test_repeated_failures_block_source() {
        let (gw, clock) = gateway(config());
        for i in 0..3 {
            let decision = gw
                .evaluate(&delivery("203.0.113.9", "{}", "sha256=00", START_MS, &i.to_string()))
                .await;
            assert_eq!(decision.status, 401);
        }

        let blocked = gw.evaluate(&signed("203.0.113.9", "{}", START_MS, "ok")).await;
        assert_eq!(blocked.status, 403);
        assert_eq!(blocked.reason, "source_blocked");
        assert_eq!(gw.blocked_ips().len(), 1);
        assert_eq!(gw.blocked_ips()[0].remaining_secs, 60);

        // Retrying while blocked does not extend the block.
        gw.evaluate(&signed("203.0.113.9", "{}", START_MS, "ok2")).await;
        assert_eq!(gw.blocked_ips()[0].consecutive_blocks, 1);

        clock.advance_secs(61);
        assert!(gw.evaluate(&signed("203.0.113.9", "{}", clock.now_ms(), "later")).await.allowed);
    }

    #[tokio::test]
    async fn test_unblock_lifts_block() {
        let (gw, _) = gateway(config());
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        for _ in 0..3 {
            gw.reputation().record_failure(ip);
        }
        assert!(gw.unblock_ip(ip));
        assert!(!gw.unblock_ip(ip));
        assert!(gw.evaluate(&signed("203.0.113.9", "{}", START_MS, "1")).await.allowed);
    }

    #[tokio::test]
    async fn test_rate_limit_ten_requests() {
        let (gw, clock) = gateway(config());
        let mut statuses = Vec::new();
        for i in 0..10 {
            let ctx = signed("198.51.100.20", &format!(r#"{{"n":{i}}}"#), START_MS, &i.to_string());
            statuses.push(gw.evaluate(&ctx).await.status);
        }
        assert_eq!(statuses, [200, 200, 200, 200, 200, 429, 429, 429, 429, 429]);

        let limited = gw
            .evaluate(&signed("198.51.100.20", r#"{"n":99}"#, START_MS, "99"))
            .await;
        assert_eq!(limited.reason, "rate_limited");
        assert_eq!(limited.retry_after_secs, Some(1));
        assert!(gw.blocked_ips().is_empty(), "rate limiting never blocks");

        clock.advance_ms(1000);
        let ctx = signed("198.51.100.20", r#"{"n":11}"#, clock.now_ms(), "11");
        assert!(gw.evaluate(&ctx).await.allowed);
    }

    #[tokio::test]
    async fn test_payload_rejection_precedes_signature() {
        let (gw, _) = gateway(config());
        let decision = gw
            .evaluate(&delivery("203.0.113.5", "{not json", "sha256=00", START_MS, "1"))
            .await;
        assert_eq!(decision.status, 422);
        assert_eq!(decision.reason, "malformed_json");

        let decision = gw
            .evaluate(&signed("203.0.113.5", r#"{"x":"<script>x</script>"}"#, START_MS, "2"))
            .await;
        assert_eq!(decision.status, 403);
        assert_eq!(decision.reason, "script_injection");
    }

    #[tokio::test]
    async fn test_route_override() {
        let mut config = config();
        config.rate_limit.routes.insert(
            "orders/create".to_string(),
            crate::config::schema::RouteLimit {
                window_ms: 1000,
                max_requests: 1,
            },
        );
        let (gw, _) = gateway(config);
        assert!(gw.evaluate(&signed("203.0.113.5", "{}", START_MS, "1")).await.allowed);
        assert_eq!(gw.evaluate(&signed("203.0.113.5", "{}", START_MS, "2")).await.status, 429);
    }

    #[tokio::test]
    async fn test_self_test_passes_without_mutation() {
        let (gw, _) = gateway(config());
        let report = gw.test_security_configuration().await;
        assert!(report.passed, "{:?}", report.stages);
        assert_eq!(report.stages.len(), 5);
        assert!(gw.state().nonces.is_empty());
        assert_eq!(gw.reputation().tracked_count(), 0);
        assert_eq!(gw.state().windows.len(), 0);
        assert_eq!(gw.state().counters.snapshot(), OutcomeSnapshot::default());
    }

    #[tokio::test]
    async fn test_self_test_flags_missing_secret() {
        let mut config = config();
        config.security.webhook_secret.clear();
        let (gw, _) = gateway(config);
        let report = gw.test_security_configuration().await;
        assert!(!report.passed);
        let signature = report.stages.iter().find(|s| s.stage == "signature").unwrap();
        assert!(!signature.passed);
    }

    #[tokio::test]
    async fn test_health_degrades_on_blocked_ips() {
        let mut config = config();
        config.health.max_blocked_ips = 0;
        let (gw, _) = gateway(config);
        assert_eq!(gw.health().status, HealthStatus::Healthy);
        for _ in 0..3 {
            gw.reputation().record_failure("203.0.113.1".parse().unwrap());
        }
        let health = gw.health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.reasons, ["too_many_blocked_ips"]);
    }

    #[tokio::test]
    async fn test_snapshot_counts_and_redacts() {
        let (gw, _) = gateway(config());
        gw.evaluate(&signed("203.0.113.5", "{}", START_MS, "1")).await;
        gw.evaluate(&delivery("203.0.113.5", "{}", "sha256=00", START_MS, "2")).await;

        let snapshot = gw.security_metrics();
        assert_eq!(snapshot.outcomes.allowed, 1);
        assert_eq!(snapshot.outcomes.authentication, 1);
        assert_eq!(snapshot.active_nonce_count, 1);
        assert_eq!(snapshot.rate_limit.mode, LimiterMode::Local);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains(SECRET));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_state() {
        let (gw, clock) = gateway(config());
        gw.evaluate(&signed("203.0.113.5", "{}", START_MS, "1")).await;
        clock.advance_secs(301);
        let report = gw.sweep();
        assert_eq!(report.nonces, 1);
        assert_eq!(report.rate_windows, 1);
    }
}
