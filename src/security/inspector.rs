//! Payload inspection.
//!
//! # Responsibilities
//! - Enforce the payload size limit before anything parses the body
//! - Reject bodies that are not a well-formed, reasonably shallow JSON document
//! - Flag header injection and plain-HTTP deliveries when HTTPS is required
//! - Coarse pattern filter for obvious injection attempts in string values
//!
//! # Checks (in order)
//! ```text
//! size (Content-Length, actual length) → singleton headers → header injection → transport
//!     → content type → empty body → nesting depth (byte scan) → JSON parse
//!     → patterns over every decoded string
//! ```
//!
//! The first structural failure ends inspection. Pattern matches accumulate.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::config::schema::GatewayConfig;
use crate::security::context::SecurityRequestContext;

/// Severity of an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// A single finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RiskReason {
    Oversized { size: u64, limit: u64 },
    MalformedHeader { header: String },
    UnsupportedContentType { content_type: Option<String> },
    EmptyBody,
    MalformedJson,
    NestingTooDeep { limit: usize },
    HeaderInjection { header: String },
    InsecureTransport,
    ScriptInjection,
    SqlInjection,
    TemplateInjection,
    PathTraversal,
}

impl RiskReason {
    pub fn level(&self) -> RiskLevel {
        match self {
            RiskReason::HeaderInjection { .. } | RiskReason::InsecureTransport => RiskLevel::Critical,
            RiskReason::Oversized { .. }
            | RiskReason::MalformedHeader { .. }
            | RiskReason::UnsupportedContentType { .. }
            | RiskReason::EmptyBody
            | RiskReason::MalformedJson
            | RiskReason::NestingTooDeep { .. }
            | RiskReason::ScriptInjection
            | RiskReason::SqlInjection => RiskLevel::High,
            RiskReason::TemplateInjection | RiskReason::PathTraversal => RiskLevel::Medium,
        }
    }

    /// Structural findings mean the request is unprocessable rather than hostile.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            RiskReason::Oversized { .. }
                | RiskReason::MalformedHeader { .. }
                | RiskReason::UnsupportedContentType { .. }
                | RiskReason::EmptyBody
                | RiskReason::MalformedJson
                | RiskReason::NestingTooDeep { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            RiskReason::Oversized { .. } => "payload_too_large",
            RiskReason::MalformedHeader { .. } => "malformed_header",
            RiskReason::UnsupportedContentType { .. } => "unsupported_content_type",
            RiskReason::EmptyBody => "empty_body",
            RiskReason::MalformedJson => "malformed_json",
            RiskReason::NestingTooDeep { .. } => "json_too_deep",
            RiskReason::HeaderInjection { .. } => "header_injection",
            RiskReason::InsecureTransport => "insecure_transport",
            RiskReason::ScriptInjection => "script_injection",
            RiskReason::SqlInjection => "sql_injection",
            RiskReason::TemplateInjection => "template_injection",
            RiskReason::PathTraversal => "path_traversal",
        }
    }
}

/// Result of inspecting one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reasons: Vec<RiskReason>,
}

impl RiskAssessment {
    fn from_reasons(reasons: Vec<RiskReason>) -> Self {
        let level = reasons
            .iter()
            .map(RiskReason::level)
            .max()
            .unwrap_or(RiskLevel::Low);
        Self { level, reasons }
    }

    /// Whether the request must be refused.
    pub fn is_rejected(&self) -> bool {
        self.reasons.iter().any(RiskReason::is_structural) || self.level >= RiskLevel::High
    }

    pub fn is_structural(&self) -> bool {
        self.reasons.iter().any(RiskReason::is_structural)
    }

    /// The finding that decides the response: the most severe, preferring a
    /// structural one among equals, then the earliest.
    pub fn primary_reason(&self) -> Option<&RiskReason> {
        self.reasons.iter().rev().max_by(|a, b| {
            a.level()
                .cmp(&b.level())
                .then(a.is_structural().cmp(&b.is_structural()))
        })
    }
}

/// Limits applied by [`PayloadInspector`].
#[derive(Debug, Clone)]
pub struct InspectorPolicy {
    pub max_payload_size: u64,
    pub max_json_depth: usize,
    pub require_https: bool,
    /// Headers that must not appear more than once.
    pub singleton_headers: Vec<String>,
}

impl InspectorPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let headers = &config.headers;
        Self {
            max_payload_size: config.security.max_payload_size as u64,
            max_json_depth: config.security.max_json_depth,
            require_https: config.security.require_https,
            singleton_headers: vec![
                headers.signature.clone(),
                headers.topic.clone(),
                headers.timestamp.clone(),
                headers.delivery_id.clone(),
                "content-type".to_string(),
                "content-length".to_string(),
            ],
        }
    }
}

#[derive(Debug)]
struct PatternRule {
    reason: RiskReason,
    regex: Regex,
}

impl PatternRule {
    fn new(reason: RiskReason, pattern: &str) -> Option<Self> {
        Regex::new(pattern).ok().map(|regex| Self { reason, regex })
    }
}

const PATTERNS: &[(RiskReason, &str)] = &[
    (RiskReason::ScriptInjection, r"(?i)<\s*/?\s*script\b"),
    (RiskReason::ScriptInjection, r"(?i)javascript\s*:"),
    (RiskReason::ScriptInjection, r"(?i)<[^>]+\bon(error|load|click|mouseover|focus)\s*="),
    (RiskReason::SqlInjection, r#"(?i)['"]\s*or\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#),
    (RiskReason::SqlInjection, r"(?i)\bunion\s+(all\s+)?select\b"),
    (RiskReason::SqlInjection, r"(?i);\s*(drop|delete|truncate|alter|insert|update)\s+\w+"),
    (RiskReason::SqlInjection, r#"(?i)['"]\s*(--|/\*)"#),
    (RiskReason::TemplateInjection, r"\{\{.*\}\}"),
    (RiskReason::TemplateInjection, r"\$\{[^}]*\}"),
    (RiskReason::TemplateInjection, r"<%.*%>"),
    (RiskReason::PathTraversal, r"\.\.[/\\]"),
    (RiskReason::PathTraversal, r"(?i)%2e%2e(%2f|%5c|/|\\)"),
];

/// Flags structurally invalid and obviously hostile payloads.
#[derive(Debug)]
pub struct PayloadInspector {
    policy: InspectorPolicy,
    rules: Vec<PatternRule>,
}

impl PayloadInspector {
    pub fn new(policy: InspectorPolicy) -> Self {
        let rules = PATTERNS
            .iter()
            .filter_map(|(reason, pattern)| PatternRule::new(reason.clone(), pattern))
            .collect();
        Self { policy, rules }
    }

    pub fn policy(&self) -> &InspectorPolicy {
        &self.policy
    }

    pub fn inspect(&self, ctx: &SecurityRequestContext) -> RiskAssessment {
        if let Some(oversized) = self.check_size(ctx) {
            return RiskAssessment::from_reasons(vec![oversized]);
        }

        let headers = ctx.headers();
        if let Some(header) = self
            .policy
            .singleton_headers
            .iter()
            .find(|name| headers.single(name).is_err())
        {
            return RiskAssessment::from_reasons(vec![RiskReason::MalformedHeader {
                header: header.clone(),
            }]);
        }

        let mut reasons: Vec<RiskReason> = headers
            .injection_suspects()
            .into_iter()
            .map(|header| RiskReason::HeaderInjection { header })
            .collect();

        if self.policy.require_https && !ctx.secure_transport() {
            reasons.push(RiskReason::InsecureTransport);
        }

        let content_type = headers.content_type();
        if !content_type.as_deref().is_some_and(is_json_media_type) {
            reasons.push(RiskReason::UnsupportedContentType { content_type });
            return RiskAssessment::from_reasons(reasons);
        }

        let body = ctx.body();
        if body.iter().all(u8::is_ascii_whitespace) {
            reasons.push(RiskReason::EmptyBody);
            return RiskAssessment::from_reasons(reasons);
        }

        if exceeds_depth(body, self.policy.max_json_depth) {
            reasons.push(RiskReason::NestingTooDeep {
                limit: self.policy.max_json_depth,
            });
            return RiskAssessment::from_reasons(reasons);
        }

        let document: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(_) => {
                reasons.push(RiskReason::MalformedJson);
                return RiskAssessment::from_reasons(reasons);
            }
        };

        let mut matched = Vec::new();
        visit_strings(&document, &mut |text| {
            for rule in &self.rules {
                if !matched.contains(&rule.reason) && rule.regex.is_match(text) {
                    matched.push(rule.reason.clone());
                }
            }
        });
        reasons.extend(matched);

        RiskAssessment::from_reasons(reasons)
    }

    fn check_size(&self, ctx: &SecurityRequestContext) -> Option<RiskReason> {
        let limit = self.policy.max_payload_size;
        let declared = ctx.headers().content_length().unwrap_or(0);
        let actual = ctx.body().len() as u64;
        let size = declared.max(actual);
        if size > limit || ctx.body_truncated() {
            Some(RiskReason::Oversized {
                size: size.max(limit.saturating_add(1)),
                limit,
            })
        } else {
            None
        }
    }
}

/// `application/json` or any `application/<subtype>+json`.
fn is_json_media_type(media_type: &str) -> bool {
    media_type == "application/json"
        || media_type
            .strip_prefix("application/")
            .is_some_and(|subtype| subtype.ends_with("+json"))
}

/// Whether object/array nesting in `body` goes deeper than `max_depth`.
/// Brackets inside string literals are ignored.
fn exceeds_depth(body: &[u8], max_depth: usize) -> bool {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for &byte in body {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                if depth > max_depth {
                    return true;
                }
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    false
}

/// Call `f` on every string value and object key in the document.
fn visit_strings(value: &Value, f: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|item| visit_strings(item, f)),
        Value::Object(map) => {
            for (key, item) in map {
                f(key);
                visit_strings(item, f);
            }
        }
        _ => {}
    }
}
