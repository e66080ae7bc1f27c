//! Webhook signature verification.
//!
//! Signatures arrive as `<algorithm>=<hex-digest>` where the digest is an HMAC
//! over the raw request body. The expected MAC is always computed and always
//! compared in constant time, including when the header is missing or
//! malformed, so rejection timing does not reveal which check failed.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Outcome category of a signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureReason {
    Valid,
    MissingSignature,
    MalformedHeader,
    UnsupportedAlgorithm,
    InvalidSignature,
}

impl SignatureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureReason::Valid => "valid",
            SignatureReason::MissingSignature => "missing_signature",
            SignatureReason::MalformedHeader => "malformed_signature",
            SignatureReason::UnsupportedAlgorithm => "unsupported_algorithm",
            SignatureReason::InvalidSignature => "invalid_signature",
        }
    }
}

impl std::fmt::Display for SignatureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of validating one request signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignatureResult {
    pub valid: bool,
    pub reason: SignatureReason,
}

impl SignatureResult {
    fn from_reason(reason: SignatureReason) -> Self {
        Self {
            valid: reason == SignatureReason::Valid,
            reason,
        }
    }
}

/// Supported MAC algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha256,
    Sha512,
}

impl SignatureAlgorithm {
    fn parse(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("sha256") {
            Some(Self::Sha256)
        } else if name.eq_ignore_ascii_case("sha512") {
            Some(Self::Sha512)
        } else {
            None
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    fn mac(self, secret: &[u8], body: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length, so construction cannot fail.
        match self {
            Self::Sha256 => match HmacSha256::new_from_slice(secret) {
                Ok(mut mac) => {
                    mac.update(body);
                    mac.finalize().into_bytes().to_vec()
                }
                Err(_) => vec![0; self.digest_len()],
            },
            Self::Sha512 => match HmacSha512::new_from_slice(secret) {
                Ok(mut mac) => {
                    mac.update(body);
                    mac.finalize().into_bytes().to_vec()
                }
                Err(_) => vec![0; self.digest_len()],
            },
        }
    }
}

/// Parsed header, or the reason it could not be used.
struct ParsedHeader {
    algorithm: SignatureAlgorithm,
    digest: Option<Vec<u8>>,
    failure: Option<SignatureReason>,
}

fn parse_header(header: Option<&str>) -> ParsedHeader {
    let fallback = |reason| ParsedHeader {
        algorithm: SignatureAlgorithm::Sha256,
        digest: None,
        failure: Some(reason),
    };

    let header = match header.map(str::trim) {
        Some(h) if !h.is_empty() => h,
        _ => return fallback(SignatureReason::MissingSignature),
    };
    let Some((name, hex_digest)) = header.split_once('=') else {
        return fallback(SignatureReason::MalformedHeader);
    };
    let Some(algorithm) = SignatureAlgorithm::parse(name.trim()) else {
        return fallback(SignatureReason::UnsupportedAlgorithm);
    };
    let hex_digest = hex_digest.trim();
    if hex_digest.is_empty() || !hex_digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return ParsedHeader {
            algorithm,
            digest: None,
            failure: Some(SignatureReason::MalformedHeader),
        };
    }

    let mut digest = vec![0u8; algorithm.digest_len()];
    if hex_digest.len() != digest.len() * 2 || hex::decode_to_slice(hex_digest, &mut digest).is_err() {
        // Well-formed hex of the wrong length is simply a wrong signature.
        return ParsedHeader {
            algorithm,
            digest: None,
            failure: Some(SignatureReason::InvalidSignature),
        };
    }

    ParsedHeader {
        algorithm,
        digest: Some(digest),
        failure: None,
    }
}

/// Validate `signature_header` against an HMAC of `raw_body` under `secret`.
pub fn validate(secret: &[u8], raw_body: &[u8], signature_header: Option<&str>) -> SignatureResult {
    let parsed = parse_header(signature_header);
    let expected = parsed.algorithm.mac(secret, raw_body);
    let zeros = vec![0u8; expected.len()];
    let provided = parsed.digest.as_deref().unwrap_or(&zeros);
    let matches: bool = expected.ct_eq(provided).into();

    match parsed.failure {
        Some(reason) => SignatureResult::from_reason(reason),
        None if matches => SignatureResult::from_reason(SignatureReason::Valid),
        None => SignatureResult::from_reason(SignatureReason::InvalidSignature),
    }
}

/// Produce a `sha256=<hex>` header value for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    sign_with(SignatureAlgorithm::Sha256, secret, body)
}

pub fn sign_with(algorithm: SignatureAlgorithm, secret: &[u8], body: &[u8]) -> String {
    format!("{}={}", algorithm.prefix(), hex::encode(algorithm.mac(secret, body)))
}

/// Validator holding the active secret and, during rotation, the previous one.
#[derive(Clone)]
pub struct SignatureValidator {
    current: Vec<u8>,
    previous: Option<Vec<u8>>,
}

impl SignatureValidator {
    pub fn new(current: impl Into<Vec<u8>>, previous: Option<Vec<u8>>) -> Self {
        Self {
            current: current.into(),
            previous: previous.filter(|p| !p.is_empty()),
        }
    }

    /// Check against every configured secret. Each comparison always runs.
    pub fn verify(&self, raw_body: &[u8], signature_header: Option<&str>) -> SignatureResult {
        let current = validate(&self.current, raw_body, signature_header);
        let previous = self
            .previous
            .as_deref()
            .map(|secret| validate(secret, raw_body, signature_header));

        match previous {
            Some(prev) if prev.valid && !current.valid => prev,
            _ => current,
        }
    }

    /// Sign with the active secret.
    pub fn sign(&self, raw_body: &[u8]) -> String {
        sign(&self.current, raw_body)
    }
}

impl std::fmt::Debug for SignatureValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureValidator")
            .field("rotating", &self.previous.is_some())
            .finish_non_exhaustive()
    }
}
