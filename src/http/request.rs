//! Request extraction.
//!
//! # Responsibilities
//! - Read the raw body without buffering past the configured maximum
//! - Resolve the originating address through trusted proxies
//! - Pick the route from the path topic or the topic header
//! - Assemble the immutable `SecurityRequestContext`
//!
//! # Design Decisions
//! - A declared `Content-Length` above the limit skips the read entirely
//! - Overlong bodies are flagged as truncated, the inspector rejects them

use std::net::SocketAddr;

use axum::body::{to_bytes, Body, Bytes};
use axum::http::Request;

use crate::config::schema::HeaderConfig;
use crate::security::context::SecurityRequestContext;
use crate::security::headers::HeaderNormalizer;
use crate::security::SecurityGateway;

/// Header carrying the request ID set by the request-id layer.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Route used when neither the path nor the topic header names one.
pub const DEFAULT_ROUTE: &str = "default";

/// Build the pipeline context for one inbound delivery.
pub async fn extract_context(
    gateway: &SecurityGateway,
    peer: SocketAddr,
    path_topic: Option<String>,
    request: Request<Body>,
) -> SecurityRequestContext {
    let config = gateway.config();
    let limit = config.security.max_payload_size;
    let received_at_ms = gateway.state().clock().now_ms();

    let (parts, body) = request.into_parts();
    let headers = HeaderNormalizer::new(&parts.headers);
    let trusted = &config.headers.trusted_proxies;

    let source_ip = headers.source_ip(&config.headers.forwarded_for, peer.ip(), trusted);
    let connection_secure = parts
        .uri
        .scheme_str()
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"));
    let secure = headers.is_https(
        &config.headers.forwarded_proto,
        peer.ip(),
        trusted,
        connection_secure,
    );
    let route = resolve_route(path_topic.as_deref(), &headers, &config.headers);
    let request_id = headers
        .first(X_REQUEST_ID)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let declared_oversize = headers
        .content_length()
        .is_some_and(|declared| declared > limit as u64);
    let (body, truncated) = if declared_oversize {
        (Bytes::new(), true)
    } else {
        read_body(body, limit).await
    };

    SecurityRequestContext::builder(source_ip, route)
        .headers(parts.headers)
        .body(body)
        .body_truncated(truncated)
        .received_at_ms(received_at_ms)
        .secure_transport(secure)
        .request_id(request_id)
        .build()
}

/// Read at most `limit` bytes. Returns `truncated = true` when the body was
/// longer or the stream failed midway.
async fn read_body(body: Body, limit: usize) -> (Bytes, bool) {
    match to_bytes(body, limit).await {
        Ok(bytes) => (bytes, false),
        Err(e) => {
            tracing::debug!(error = %e, limit, "Body read aborted");
            (Bytes::new(), true)
        }
    }
}

fn resolve_route(path_topic: Option<&str>, headers: &HeaderNormalizer<'_>, names: &HeaderConfig) -> String {
    if let Some(topic) = path_topic.map(|t| t.trim_matches('/')).filter(|t| !t.is_empty()) {
        return topic.to_string();
    }
    // A duplicated topic header is rejected by the inspector; route it anywhere.
    match headers.single(&names.topic) {
        Ok(Some(topic)) if !topic.trim().is_empty() => topic.trim().to_string(),
        _ => DEFAULT_ROUTE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::GatewayConfig;
    use crate::security::clock::ManualClock;
    use crate::security::SecurityState;
    use std::sync::Arc;

    fn gateway(max_payload_size: usize) -> SecurityGateway {
        let mut config = GatewayConfig::default();
        config.security.max_payload_size = max_payload_size;
        let state = Arc::new(SecurityState::new(&config, Arc::new(ManualClock::new(42_000))));
        SecurityGateway::new(Arc::new(config), state)
    }

    fn peer(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 40_000)
    }

    #[tokio::test]
    async fn test_path_topic_wins_over_header() {
        let gw = gateway(1024);
        let request = Request::post("/webhooks/orders/create")
            .header("x-webhook-topic", "products/update")
            .header(X_REQUEST_ID, "req-7")
            .body(Body::from("{}"))
            .unwrap();

        let ctx = extract_context(&gw, peer("203.0.113.4"), Some("orders/create".into()), request).await;
        assert_eq!(ctx.route(), "orders/create");
        assert_eq!(ctx.request_id(), "req-7");
        assert_eq!(ctx.received_at_ms(), 42_000);
        assert_eq!(ctx.body().as_ref(), b"{}");
        assert!(!ctx.body_truncated());
    }

    #[tokio::test]
    async fn test_topic_header_and_default_route() {
        let gw = gateway(1024);
        let request = Request::post("/webhooks")
            .header("x-webhook-topic", " products/update ")
            .body(Body::from("{}"))
            .unwrap();
        let ctx = extract_context(&gw, peer("203.0.113.4"), None, request).await;
        assert_eq!(ctx.route(), "products/update");

        let request = Request::post("/webhooks").body(Body::from("{}")).unwrap();
        let ctx = extract_context(&gw, peer("203.0.113.4"), None, request).await;
        assert_eq!(ctx.route(), DEFAULT_ROUTE);
        assert!(!ctx.request_id().is_empty());
    }

    #[tokio::test]
    async fn test_forwarded_for_only_from_trusted_peer() {
        let gw = gateway(1024);
        let forwarded = || {
            Request::post("/webhooks")
                .header("x-forwarded-for", "198.51.100.9, 10.0.0.1")
                .header("x-forwarded-proto", "https")
                .body(Body::from("{}"))
                .unwrap()
        };

        let ctx = extract_context(&gw, peer("127.0.0.1"), None, forwarded()).await;
        assert_eq!(ctx.source_ip().to_string(), "198.51.100.9");
        assert!(ctx.secure_transport());

        let ctx = extract_context(&gw, peer("203.0.113.4"), None, forwarded()).await;
        assert_eq!(ctx.source_ip().to_string(), "203.0.113.4");
        assert!(!ctx.secure_transport());
    }

    #[tokio::test]
    async fn test_overlong_body_is_truncated() {
        let gw = gateway(8);
        let request = Request::post("/webhooks")
            .body(Body::from(r#"{"a":"0123456789"}"#))
            .unwrap();
        let ctx = extract_context(&gw, peer("203.0.113.4"), None, request).await;
        assert!(ctx.body_truncated());
        assert!(ctx.body().is_empty());

        let request = Request::post("/webhooks")
            .header("content-length", "4096")
            .body(Body::from("{}"))
            .unwrap();
        let ctx = extract_context(&gw, peer("203.0.113.4"), None, request).await;
        assert!(ctx.body_truncated());
    }
}
