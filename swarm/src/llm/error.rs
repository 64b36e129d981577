//! Model call failures

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Endpoint rate limited the call; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Endpoint answered {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Endpoint unreachable: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Malformed completion: {0}")]
    InvalidResponse(String),

    #[error("No completion within {0:?}")]
    Timeout(Duration),

    #[error("Completion body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No model endpoints configured")]
    NoEndpoints,
}

impl LlmError {
    /// HTTP status behind the failure, when there was a response
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::ApiError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether another attempt (here or on the next endpoint) may succeed
    ///
    /// Transport trouble, timeouts, throttling and server-side statuses are
    /// transient; anything the endpoint rejected on its merits is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::ApiError { status, .. } => matches!(*status, 408 | 409 | 500..=599),
            Self::InvalidResponse(_) | Self::Json(_) | Self::NoEndpoints => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16) -> LlmError {
        LlmError::ApiError {
            status,
            message: "body".to_string(),
        }
    }

    #[test]
    fn test_server_side_statuses_are_retryable() {
        for status in [408, 409, 500, 502, 503, 599] {
            assert!(api(status).is_retryable(), "{} should retry", status);
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!api(status).is_retryable(), "{} should not retry", status);
        }
    }

    #[test]
    fn test_transport_and_throttling_retry() {
        assert!(LlmError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(
            LlmError::RateLimited {
                retry_after: Duration::from_secs(5)
            }
            .is_retryable()
        );
        assert!(!LlmError::InvalidResponse("no choices".to_string()).is_retryable());
        assert!(!LlmError::NoEndpoints.is_retryable());
    }

    #[test]
    fn test_status() {
        assert_eq!(api(503).status(), Some(503));
        assert_eq!(
            LlmError::RateLimited {
                retry_after: Duration::ZERO
            }
            .status(),
            Some(429)
        );
        assert_eq!(LlmError::NoEndpoints.status(), None);
    }
}
