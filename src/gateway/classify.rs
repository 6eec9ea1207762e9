//! Rate-limit detection.
//!
//! All knowledge of provider error shapes lives here. The executor only
//! branches on [`ErrorClass`].

use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::core::error::{ProviderError, RATE_LIMIT_CODE};

/// `@type` of the detail entry carrying a retry delay
pub const RETRY_INFO_TYPE: &str = "type.googleapis.com/google.rpc.RetryInfo";

const RATE_LIMIT_STATUSES: [&str; 2] = ["RESOURCE_EXHAUSTED", "RATE_LIMIT_EXCEEDED"];

/// Outcome of inspecting a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate-limited; may carry the provider's retry hint
    Retryable { retry_after: Option<Duration> },
    /// Anything else; propagated without retry
    Terminal,
}

/// Classify a normalized provider error
pub fn classify(error: &ProviderError) -> ErrorClass {
    match error {
        ProviderError::RateLimited { retry_after_ms, .. } => ErrorClass::Retryable {
            retry_after: retry_after_ms.map(Duration::from_millis),
        },
        _ => ErrorClass::Terminal,
    }
}

/// Classify a raw provider error body.
///
/// Looks at `error.code` / `error.status` first and falls back to the
/// top-level `code` / `status`.
pub fn classify_value(body: &JsonValue) -> ErrorClass {
    let inner = body.get("error").filter(|e| e.is_object()).unwrap_or(body);

    let code = inner
        .get("code")
        .and_then(as_code)
        .or_else(|| body.get("code").and_then(as_code));
    let status = inner
        .get("status")
        .and_then(|s| s.as_str())
        .or_else(|| body.get("status").and_then(|s| s.as_str()));

    let rate_limited = code == Some(RATE_LIMIT_CODE as i64)
        || status.is_some_and(|s| RATE_LIMIT_STATUSES.contains(&s));

    if rate_limited {
        ErrorClass::Retryable {
            retry_after: retry_after_hint(inner),
        }
    } else {
        ErrorClass::Terminal
    }
}

/// Extract a RetryInfo delay from an error's `details` list
pub fn retry_after_hint(error: &JsonValue) -> Option<Duration> {
    error
        .get("details")?
        .as_array()?
        .iter()
        .filter(|d| d.get("@type").and_then(|t| t.as_str()) == Some(RETRY_INFO_TYPE))
        .find_map(|d| d.get("retryDelay").and_then(|r| r.as_str()).and_then(parse_retry_delay))
}

/// Parse a protobuf-style duration such as `"3s"` or `"1.5s"`
pub fn parse_retry_delay(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().strip_suffix('s')?.trim().parse().ok()?;
    if secs >= 0.0 {
        // Delays beyond what a Duration can hold are ignored
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// Whole milliseconds of `d`, saturating at `u64::MAX`
pub fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn as_code(v: &JsonValue) -> Option<i64> {
    v.as_i64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

impl ProviderError {
    /// Normalize a raw provider error body (nested `{error: {...}}` or flat).
    ///
    /// `http_status` is used when the body carries no code of its own.
    pub fn from_json(body: &JsonValue, http_status: Option<u16>) -> Self {
        let inner = body.get("error").filter(|e| e.is_object()).unwrap_or(body);
        let message = inner
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("provider error")
            .to_string();
        let code = inner
            .get("status")
            .and_then(|s| s.as_str())
            .or_else(|| body.get("status").and_then(|s| s.as_str()))
            .map(|s| s.to_string());
        let status = inner
            .get("code")
            .and_then(as_code)
            .or_else(|| body.get("code").and_then(as_code))
            .and_then(|c| u16::try_from(c).ok())
            .or(http_status);
        let details = Some(body.to_string());

        if let ErrorClass::Retryable { retry_after } = classify_value(body) {
            return ProviderError::RateLimited {
                details,
                code,
                message,
                status: status.or(Some(RATE_LIMIT_CODE)),
                retry_after_ms: retry_after.map(duration_millis),
            };
        }

        // Rate limits can also be signalled by the transport alone
        if http_status == Some(RATE_LIMIT_CODE) {
            return ProviderError::RateLimited {
                details,
                code,
                message,
                status,
                retry_after_ms: None,
            };
        }

        match status {
            Some(401) | Some(403) => ProviderError::Auth {
                details,
                code,
                message,
                status,
            },
            Some(404) => ProviderError::ModelUnavailable {
                details,
                code,
                message,
                status,
            },
            Some(s) if s >= 500 => ProviderError::ServerError {
                details,
                code,
                message,
                status,
            },
            _ => ProviderError::InvalidParams {
                details,
                code,
                message,
                status,
            },
        }
    }
}
