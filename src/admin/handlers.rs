use std::net::IpAddr;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::http::server::AppState;
use crate::security::gateway::{BlockedIp, HealthReport, HealthStatus, SecurityMetricsSnapshot};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    #[serde(flatten)]
    pub security: SecurityMetricsSnapshot,
}

#[derive(Serialize)]
pub struct BlockedIps {
    pub count: usize,
    pub blocked: Vec<BlockedIp>,
}

/// Body of `POST /admin/security`.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum AdminAction {
    UnblockIp { ip: IpAddr },
    TestSecurity,
}

#[derive(Serialize)]
pub struct UnblockResult {
    pub success: bool,
    pub ip: IpAddr,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let inner = state.inner.load();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        security: inner.security_metrics(),
    })
}

pub async fn get_blocked_ips(State(state): State<AppState>) -> Json<BlockedIps> {
    let blocked = state.inner.load().blocked_ips();
    Json(BlockedIps {
        count: blocked.len(),
        blocked,
    })
}

/// 503 while degraded.
pub async fn get_health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.inner.load().health();
    let status = match report.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}

pub async fn post_action(State(state): State<AppState>, Json(action): Json<AdminAction>) -> Response {
    let inner = state.inner.load_full();
    match action {
        AdminAction::UnblockIp { ip } => {
            let success = inner.unblock_ip(ip);
            tracing::info!(%ip, success, "Admin unblock requested");
            Json(UnblockResult { success, ip }).into_response()
        }
        AdminAction::TestSecurity => Json(inner.test_security_configuration().await).into_response(),
    }
}
