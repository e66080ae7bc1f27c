//! Exponential backoff without jitter.
//!
//! Block durations must be reproducible and monotonic for a repeat offender,
//! so unlike retry delays they carry no random component.

/// `base * 2^exponent`, saturating, capped at `max`.
pub fn exponential_ms(base_ms: u64, exponent: u32, max_ms: u64) -> u64 {
    let factor = 2u64.saturating_pow(exponent);
    base_ms.saturating_mul(factor).min(max_ms)
}
