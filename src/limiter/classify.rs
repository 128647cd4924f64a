//! Upstream error taxonomy.
//!
//! Every fetch failure collapses into one of four classes that drive the
//! pacing policy: transient faults are retried with short backoff, throttle
//! signals stretch the polling interval, fatal faults end the run.

use crate::providers::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// DNS, resets, timeouts, 5xx, empty bodies. Worth retrying soon.
    Transient,
    /// 429 or a vendor throttle token. Slow down before retrying.
    RateLimited,
    /// Auth revoked, blocked symbol, other 4xx. Retrying will not help.
    Fatal,
    Unknown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Fatal => "fatal",
            ErrorClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Throttle phrases some vendors put in an otherwise ordinary body.
const THROTTLE_TOKENS: [&str; 3] = ["too many requests", "访问过于频繁", "rate limit"];

fn has_throttle_token(detail: &str) -> bool {
    let lower = detail.to_lowercase();
    THROTTLE_TOKENS.iter().any(|t| lower.contains(t))
}

pub fn classify(err: &FetchError) -> ErrorClass {
    match err {
        FetchError::EmptyResponse => ErrorClass::Transient,
        FetchError::Throttled(_) => ErrorClass::RateLimited,
        FetchError::Http { status, detail } => match status {
            429 => ErrorClass::RateLimited,
            500..=599 => ErrorClass::Transient,
            400..=499 if has_throttle_token(detail) => ErrorClass::RateLimited,
            400..=499 => ErrorClass::Fatal,
            _ => ErrorClass::Unknown,
        },
        // Connect refused, resets, timeouts, truncated bodies.
        FetchError::Transport(_) => ErrorClass::Transient,
        // The breaker opening is self-inflicted; treat like a transient and
        // let the backoff ride out the breaker timeout.
        FetchError::BreakerOpen(_) => ErrorClass::Transient,
        FetchError::Cancelled => ErrorClass::Fatal,
    }
}
