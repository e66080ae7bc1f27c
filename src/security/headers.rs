//! Header normalization and source resolution.
//!
//! # Responsibilities
//! - Case-insensitive, duplicate-aware lookup of security-relevant headers
//! - Resolve the client address from `X-Forwarded-For` behind trusted proxies
//! - Detect control sequences smuggled into header values
//!
//! # Design Decisions
//! - Singleton security headers (signature, timestamp, topic) must appear once
//! - Never trust existing X-Forwarded-* from untrusted peers
//! - All header reads for the gateway go through [`HeaderNormalizer`]

use std::net::IpAddr;

use axum::http::{header, HeaderMap};
use thiserror::Error;

/// A header could not be read as a single well-formed value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("header `{0}` appears more than once")]
    Duplicate(String),

    #[error("header `{0}` is not valid UTF-8")]
    NotUtf8(String),
}

/// Read-only, case-insensitive view over a request's headers.
#[derive(Debug, Clone, Copy)]
pub struct HeaderNormalizer<'a> {
    headers: &'a HeaderMap,
}

impl<'a> HeaderNormalizer<'a> {
    pub fn new(headers: &'a HeaderMap) -> Self {
        Self { headers }
    }

    /// Look up a header that must appear at most once.
    ///
    /// Empty and whitespace-only values are reported as `Ok(None)`.
    pub fn single(&self, name: &str) -> Result<Option<&'a str>, HeaderError> {
        let mut values = self.headers.get_all(name).iter();
        let Some(first) = values.next() else {
            return Ok(None);
        };
        if values.next().is_some() {
            return Err(HeaderError::Duplicate(name.to_ascii_lowercase()));
        }
        let value = first
            .to_str()
            .map_err(|_| HeaderError::NotUtf8(name.to_ascii_lowercase()))?
            .trim();
        Ok((!value.is_empty()).then_some(value))
    }

    /// First readable value of a header, ignoring duplicates.
    pub fn first(&self, name: &str) -> Option<&'a str> {
        self.headers
            .get_all(name)
            .iter()
            .find_map(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Media type of the body without parameters, lowercased.
    pub fn content_type(&self) -> Option<String> {
        self.first(header::CONTENT_TYPE.as_str()).map(|v| {
            v.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }

    /// Declared body length, if present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.first(header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok())
    }

    /// Names of headers whose values carry raw or percent-encoded CR, LF or NUL.
    pub fn injection_suspects(&self) -> Vec<String> {
        let mut suspects: Vec<String> = self
            .headers
            .iter()
            .filter(|(_, value)| contains_line_break(value.as_bytes()))
            .map(|(name, _)| name.as_str().to_string())
            .collect();
        suspects.dedup();
        suspects
    }

    /// Resolve the originating client address.
    ///
    /// The first hop of the forwarded chain is honoured only when the
    /// connection itself comes from a trusted proxy.
    pub fn source_ip(&self, forwarded_header: &str, peer: IpAddr, trusted: &[IpAddr]) -> IpAddr {
        if !trusted.contains(&peer) {
            return peer;
        }
        self.first(forwarded_header)
            .and_then(|chain| chain.split(',').next())
            .and_then(|hop| hop.trim().parse().ok())
            .unwrap_or(peer)
    }

    /// Whether the request reached the edge over HTTPS.
    pub fn is_https(
        &self,
        proto_header: &str,
        peer: IpAddr,
        trusted: &[IpAddr],
        connection_secure: bool,
    ) -> bool {
        if connection_secure {
            return true;
        }
        trusted.contains(&peer)
            && self
                .first(proto_header)
                .and_then(|chain| chain.split(',').next())
                .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
    }
}

fn contains_line_break(bytes: &[u8]) -> bool {
    if bytes
        .iter()
        .any(|b| matches!(b, b'\r' | b'\n' | b'\0'))
    {
        return true;
    }
    bytes.windows(3).any(|w| {
        w[0] == b'%' && w[1] == b'0' && matches!(w[2].to_ascii_lowercase(), b'a' | b'd' | b'0')
    })
}
