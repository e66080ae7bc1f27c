//! Typed pipeline rejections.

use std::net::IpAddr;

use axum::http::StatusCode;
use thiserror::Error;

use crate::security::inspector::{RiskAssessment, RiskReason};
use crate::security::rate_limit::RateLimitDecision;
use crate::security::replay::ReplayRejection;
use crate::security::signature::SignatureReason;

/// Why the gateway refused a request.
#[derive(Debug, Clone, Error)]
pub enum SecurityError {
    #[error("authentication failed: {0}")]
    Authentication(SignatureReason),

    #[error("replay protection rejected request: {0}")]
    Replay(ReplayRejection),

    #[error("payload rejected: {}", payload_code(.0))]
    Payload(RiskAssessment),

    #[error("rate limit exceeded for {}", .0.limit_key)]
    RateLimitExceeded(RateLimitDecision),

    #[error("source {0} is blocked")]
    SourceBlocked(IpAddr),

    #[error("processing budget of {0}ms exceeded")]
    Timeout(u64),
}

fn payload_code(assessment: &RiskAssessment) -> &'static str {
    assessment
        .primary_reason()
        .map_or("payload_rejected", |r| r.code())
}

impl SecurityError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SecurityError::Authentication(_) | SecurityError::Replay(_) => StatusCode::UNAUTHORIZED,
            SecurityError::Payload(assessment)
                if assessment.primary_reason().is_some_and(RiskReason::is_structural) =>
            {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SecurityError::Payload(_) | SecurityError::SourceBlocked(_) => StatusCode::FORBIDDEN,
            SecurityError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            SecurityError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code returned to clients.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SecurityError::Authentication(reason) => reason.as_str(),
            SecurityError::Replay(rejection) => rejection.as_str(),
            SecurityError::Payload(assessment) => payload_code(assessment),
            SecurityError::RateLimitExceeded(_) => "rate_limited",
            SecurityError::SourceBlocked(_) => "source_blocked",
            SecurityError::Timeout(_) => "processing_timeout",
        }
    }

    /// Whether this rejection counts against the source's reputation.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            SecurityError::Authentication(_) | SecurityError::Replay(_) | SecurityError::Payload(_)
        )
    }

    /// Metric label for the stage that rejected.
    pub fn stage(&self) -> &'static str {
        match self {
            SecurityError::Authentication(_) => "authentication",
            SecurityError::Replay(_) => "replay",
            SecurityError::Payload(_) => "payload",
            SecurityError::RateLimitExceeded(_) => "rate_limit",
            SecurityError::SourceBlocked(_) => "blocked",
            SecurityError::Timeout(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::inspector::RiskLevel;

    fn assessment(reason: RiskReason) -> RiskAssessment {
        RiskAssessment {
            level: reason.level(),
            reasons: vec![reason],
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            SecurityError::Authentication(SignatureReason::InvalidSignature).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            SecurityError::Replay(ReplayRejection::Duplicate).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            SecurityError::Payload(assessment(RiskReason::MalformedJson)).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            SecurityError::Payload(assessment(RiskReason::ScriptInjection)).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            SecurityError::SourceBlocked("192.0.2.1".parse().unwrap()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(SecurityError::Timeout(250).status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_most_severe_finding_sets_status() {
        let err = SecurityError::Payload(RiskAssessment {
            level: RiskLevel::Critical,
            reasons: vec![
                RiskReason::EmptyBody,
                RiskReason::HeaderInjection {
                    header: "x-webhook-topic".to_string(),
                },
            ],
        });
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.reason_code(), "header_injection");
    }

    #[test]
    fn test_reason_codes() {
        let err = SecurityError::Payload(assessment(RiskReason::Oversized { size: 10, limit: 5 }));
        assert_eq!(err.reason_code(), "payload_too_large");
        assert_eq!(err.to_string(), "payload rejected: payload_too_large");
        assert_eq!(
            SecurityError::Authentication(SignatureReason::MissingSignature).reason_code(),
            "missing_signature"
        );
        assert_eq!(SecurityError::Timeout(1).reason_code(), "processing_timeout");
    }

    #[test]
    fn test_failure_feedback() {
        assert!(SecurityError::Authentication(SignatureReason::InvalidSignature).counts_as_failure());
        assert!(SecurityError::Replay(ReplayRejection::Stale).counts_as_failure());
        assert!(SecurityError::Payload(RiskAssessment {
            level: RiskLevel::Critical,
            reasons: vec![RiskReason::InsecureTransport],
        })
        .counts_as_failure());
        assert!(!SecurityError::SourceBlocked("192.0.2.1".parse().unwrap()).counts_as_failure());
        assert!(!SecurityError::Timeout(1).counts_as_failure());
    }
}
