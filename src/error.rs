use std::time::Duration;

use thiserror::Error;

use crate::{result::RateLimitResult, strategy::StrategyKind};

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur in the rate limit engine
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Exceeded(Box<RateLimitExceeded>),

    #[error("Storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RateLimitError {
    /// True when the storage layer failed rather than the caller being limited.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            RateLimitError::BackendUnavailable(_)
                | RateLimitError::Storage(_)
                | RateLimitError::Serialization(_)
                | RateLimitError::Io(_)
        )
    }

    /// The denial details, if this error is a rate limit denial.
    pub fn as_exceeded(&self) -> Option<&RateLimitExceeded> {
        match self {
            RateLimitError::Exceeded(exceeded) => Some(exceeded),
            _ => None,
        }
    }
}

impl From<RateLimitExceeded> for RateLimitError {
    fn from(exceeded: RateLimitExceeded) -> Self {
        RateLimitError::Exceeded(Box::new(exceeded))
    }
}

impl From<redis::RedisError> for RateLimitError {
    fn from(e: redis::RedisError) -> Self {
        RateLimitError::BackendUnavailable(format!("Redis error: {}", e))
    }
}

/// Raised by `enforce` when a limit is hit.
///
/// Carries the denied [`RateLimitResult`] so callers can build a 429
/// response with the standard rate limit headers.
#[derive(Error, Debug, Clone)]
#[error(
    "[{strategy}] Rate limit exceeded for '{key}'. Retry after {:.2}s (limit={limit})",
    .retry_after.as_secs_f64()
)]
pub struct RateLimitExceeded {
    pub key: String,
    pub retry_after: Duration,
    pub limit: u64,
    pub strategy: StrategyKind,
    /// Index of the failing tier when raised by a tiered limiter
    pub tier: Option<usize>,
    pub result: RateLimitResult,
}

impl RateLimitExceeded {
    pub fn from_result(result: RateLimitResult) -> Self {
        Self {
            key: result.key.clone(),
            retry_after: result.retry_after,
            limit: result.limit,
            strategy: result.strategy,
            tier: None,
            result,
        }
    }

    pub(crate) fn with_tier(mut self, tier: usize) -> Self {
        self.tier = Some(tier);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn denied_result() -> RateLimitResult {
        RateLimitResult {
            allowed: false,
            key: "user:42".to_string(),
            remaining: 0,
            limit: 3,
            reset_at: Utc::now(),
            retry_after: Duration::from_millis(1250),
            strategy: StrategyKind::TokenBucket,
        }
    }

    #[test]
    fn test_exceeded_message() {
        let exceeded = RateLimitExceeded::from_result(denied_result());
        assert_eq!(
            exceeded.to_string(),
            "[token_bucket] Rate limit exceeded for 'user:42'. Retry after 1.25s (limit=3)"
        );
    }

    #[test]
    fn test_error_classification() {
        let err: RateLimitError = RateLimitExceeded::from_result(denied_result()).into();
        assert!(!err.is_backend_failure());
        assert_eq!(err.as_exceeded().unwrap().limit, 3);

        let err = RateLimitError::BackendUnavailable("connection refused".to_string());
        assert!(err.is_backend_failure());
        assert!(err.as_exceeded().is_none());

        let err = RateLimitError::Config("limit must be positive".to_string());
        assert!(!err.is_backend_failure());
    }
}
