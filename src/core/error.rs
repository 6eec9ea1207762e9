use chrono::{DateTime, Utc};
use thiserror::Error;

/// HTTP-style code carried by every rate-limit failure surfaced to callers
pub const RATE_LIMIT_CODE: u16 = 429;

/// Normalized provider-layer errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Invalid parameters: {message}")]
    InvalidParams {
        details: Option<String>,
        code: Option<String>,
        message: String,
        status: Option<u16>,
    },

    #[error("Rate limited: {message}")]
    RateLimited {
        details: Option<String>,
        code: Option<String>,
        message: String,
        status: Option<u16>,
        retry_after_ms: Option<u64>,
    },

    #[error("Authentication error: {message}")]
    Auth {
        details: Option<String>,
        code: Option<String>,
        message: String,
        status: Option<u16>,
    },

    #[error("Model unavailable: {message}")]
    ModelUnavailable {
        details: Option<String>,
        code: Option<String>,
        message: String,
        status: Option<u16>,
    },

    #[error("Server error: {message}")]
    ServerError {
        details: Option<String>,
        code: Option<String>,
        message: String,
        status: Option<u16>,
    },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },
}

impl ProviderError {
    /// Convenience to construct an InvalidParams error
    pub fn invalid_params(message: impl Into<String>, status: Option<u16>) -> Self {
        ProviderError::InvalidParams {
            details: None,
            code: None,
            message: message.into(),
            status,
        }
    }

    /// Convenience to construct a RateLimited error
    pub fn rate_limited(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        ProviderError::RateLimited {
            details: None,
            code: None,
            message: message.into(),
            status: Some(RATE_LIMIT_CODE),
            retry_after_ms,
        }
    }

    /// HTTP status reported by the provider, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::InvalidParams { status, .. }
            | ProviderError::RateLimited { status, .. }
            | ProviderError::Auth { status, .. }
            | ProviderError::ModelUnavailable { status, .. }
            | ProviderError::ServerError { status, .. } => *status,
            ProviderError::Network { .. } | ProviderError::InvalidResponse { .. } => None,
        }
    }
}

/// Errors surfaced by the gateway to its callers
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Retries exhausted while the provider kept rate-limiting the call
    #[error("Rate limit exceeded for '{operation}' after {attempts} attempt(s): {source}")]
    RateLimited {
        operation: String,
        attempts: u32,
        retried: bool,
        retry_after_ms: Option<u64>,
        next_retry_at: Option<DateTime<Utc>>,
        source: ProviderError,
    },

    /// Non-retryable provider failure, passed through unchanged
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The caller abandoned the call before it settled
    #[error("Operation '{operation}' was cancelled")]
    Cancelled { operation: String },

    /// The gateway was shut down
    #[error("Gateway is shut down")]
    Shutdown,
}

impl GatewayError {
    /// Numeric code callers branch on; `Some(429)` means "quota exhausted, try later"
    pub fn code(&self) -> Option<u16> {
        match self {
            GatewayError::RateLimited { .. } => Some(RATE_LIMIT_CODE),
            GatewayError::Provider(e) => e.status(),
            GatewayError::Cancelled { .. } | GatewayError::Shutdown => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GatewayError::RateLimited { .. })
    }

    /// Whether at least one retry happened before giving up
    pub fn retried(&self) -> bool {
        matches!(self, GatewayError::RateLimited { retried: true, .. })
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            GatewayError::RateLimited { next_retry_at, .. } => *next_retry_at,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_gateway_error_reports_429() {
        let err = GatewayError::RateLimited {
            operation: "synthesis".to_string(),
            attempts: 4,
            retried: true,
            retry_after_ms: Some(3000),
            next_retry_at: None,
            source: ProviderError::rate_limited("quota", Some(3000)),
        };
        assert_eq!(err.code(), Some(429));
        assert!(err.retried());
        assert!(err.to_string().contains("synthesis"));
    }

    #[test]
    fn test_provider_error_passes_status_through() {
        let err = GatewayError::from(ProviderError::invalid_params("bad prompt", Some(400)));
        assert_eq!(err.code(), Some(400));
        assert!(!err.is_rate_limited());
        assert_eq!(err.to_string(), "Invalid parameters: bad prompt");
    }
}
