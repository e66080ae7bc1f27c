//! Decision responses.
//!
//! # Responsibilities
//! - Map a `GatewayDecision` to status code and JSON body
//! - Attach rate-limit headers to quota-bearing responses
//!
//! # Design Decisions
//! - The body carries only the stable reason code, never internal detail
//! - `X-RateLimit-Reset` is the window end in Unix seconds

use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::security::GatewayDecision;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

impl IntoResponse for GatewayDecision {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut extra = Vec::with_capacity(4);
        if let Some(quota) = &self.rate_limit {
            extra.push((X_RATELIMIT_LIMIT, HeaderValue::from(quota.limit)));
            extra.push((X_RATELIMIT_REMAINING, HeaderValue::from(quota.remaining)));
            extra.push((X_RATELIMIT_RESET, HeaderValue::from(quota.reset_at_ms.div_ceil(1000))));
        }
        if let Some(secs) = self.retry_after_secs {
            extra.push((header::RETRY_AFTER, HeaderValue::from(secs)));
        }

        let mut response = (status, Json(self)).into_response();
        response.headers_mut().extend(extra);
        response
    }
}
