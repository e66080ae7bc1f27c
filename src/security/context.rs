//! Immutable per-request view consumed by every pipeline stage.

use std::net::IpAddr;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::security::headers::HeaderNormalizer;

/// One inbound webhook delivery as seen by the gateway.
#[derive(Debug, Clone)]
pub struct SecurityRequestContext {
    body: Bytes,
    headers: HeaderMap,
    source_ip: IpAddr,
    received_at_ms: u64,
    route: String,
    secure_transport: bool,
    body_truncated: bool,
    request_id: String,
}

impl SecurityRequestContext {
    pub fn builder(source_ip: IpAddr, route: impl Into<String>) -> ContextBuilder {
        ContextBuilder {
            ctx: SecurityRequestContext {
                body: Bytes::new(),
                headers: HeaderMap::new(),
                source_ip,
                received_at_ms: 0,
                route: route.into(),
                secure_transport: false,
                body_truncated: false,
                request_id: String::new(),
            },
        }
    }

    /// Raw body bytes exactly as received.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn headers(&self) -> HeaderNormalizer<'_> {
        HeaderNormalizer::new(&self.headers)
    }

    pub fn source_ip(&self) -> IpAddr {
        self.source_ip
    }

    pub fn received_at_ms(&self) -> u64 {
        self.received_at_ms
    }

    /// Route or topic the delivery targets.
    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn secure_transport(&self) -> bool {
        self.secure_transport
    }

    /// Set when the body stream exceeded the read limit and was discarded.
    pub fn body_truncated(&self) -> bool {
        self.body_truncated
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

/// Builder for [`SecurityRequestContext`].
#[derive(Debug)]
pub struct ContextBuilder {
    ctx: SecurityRequestContext,
}

impl ContextBuilder {
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.ctx.body = body.into();
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.ctx.headers = headers;
        self
    }

    /// Append one header. Invalid names or values are skipped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.ctx.headers.append(name, value);
        }
        self
    }

    pub fn received_at_ms(mut self, now_ms: u64) -> Self {
        self.ctx.received_at_ms = now_ms;
        self
    }

    pub fn secure_transport(mut self, secure: bool) -> Self {
        self.ctx.secure_transport = secure;
        self
    }

    pub fn body_truncated(mut self, truncated: bool) -> Self {
        self.ctx.body_truncated = truncated;
        self
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.ctx.request_id = id.into();
        self
    }

    pub fn build(self) -> SecurityRequestContext {
        self.ctx
    }
}
