//! Failure taxonomy for provider fetches.
//!
//! Adapters classify every failure into a [`FetchError`] so the retry layer
//! can decide what to do without provider-specific knowledge.

use std::time::Duration;

use thiserror::Error;

use super::SourceId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The provider did not answer within the configured timeout.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// Connection, DNS, TLS or 5xx failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The provider signalled a rate limit (HTTP 429 or equivalent).
    #[error("Rate limited{}", .retry_after.map(|d| format!(" (retry after {d:?})")).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// The provider answered but had nothing to offer for the pair.
    #[error("Empty result: {0}")]
    EmptyResult(String),

    /// The response could not be parsed or failed validation.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    /// Whether the retrying fetcher may try again within the same attempt window.
    ///
    /// Rate limits are handled by the cooldown tracker instead, and empty or
    /// malformed answers will not change on an immediate retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }

    pub fn empty(message: impl Into<String>) -> Self {
        Self::EmptyResult(message.into())
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(Duration::ZERO);
        }
        if err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
            return Self::RateLimited { retry_after: None };
        }
        if err.is_decode() {
            return Self::MalformedResponse(err.to_string());
        }
        Self::Network(err.to_string())
    }
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> FetchError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        FetchError::RateLimited { retry_after: None }
    } else if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
        FetchError::Network(format!("HTTP {status}: {body}"))
    } else {
        FetchError::MalformedResponse(format!("HTTP {status}: {body}"))
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// The retry budget was used up without a usable quote.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{source_id} fetch exhausted after {attempts} attempt(s): {last_error}")]
pub struct FetchExhausted {
    pub source_id: SourceId,
    pub attempts: u32,
    pub last_error: FetchError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(FetchError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(FetchError::Network("reset".into()).is_retryable());
        assert!(!FetchError::RateLimited { retry_after: None }.is_retryable());
        assert!(!FetchError::empty("no offers").is_retryable());
        assert!(!FetchError::malformed("bad json").is_retryable());
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "").is_rate_limited());
        assert!(classify_status(reqwest::StatusCode::BAD_GATEWAY, "").is_retryable());
        assert_eq!(
            classify_status(reqwest::StatusCode::UNAUTHORIZED, "nope"),
            FetchError::MalformedResponse("HTTP 401 Unauthorized: nope".to_string())
        );
    }

    #[test]
    fn error_display() {
        let err = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.to_string(), "Rate limited (retry after 30s)");

        let exhausted = FetchExhausted {
            source_id: SourceId::FxBroker,
            attempts: 3,
            last_error: FetchError::Timeout(Duration::from_secs(15)),
        };
        assert_eq!(
            exhausted.to_string(),
            "FX_BROKER fetch exhausted after 3 attempt(s): Timeout after 15s"
        );
    }
}
