use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::strategy::StrategyKind;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Outcome of a single rate limit check
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub key: String,
    /// Capacity left after this call when allowed, without it when denied
    pub remaining: u64,
    pub limit: u64,
    /// Wall-clock time at which the quota is fully restored
    pub reset_at: DateTime<Utc>,
    /// Minimum wait before a denied caller could succeed; zero when allowed
    pub retry_after: Duration,
    pub strategy: StrategyKind,
}

impl RateLimitResult {
    /// Standard HTTP rate limit response headers.
    ///
    /// `Retry-After` is rounded up to whole seconds so a client honouring
    /// it never retries early.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        self.header_entries()
            .into_iter()
            .map(|(name, _, value)| (name, value))
            .collect()
    }

    /// Same headers as [`headers`](Self::headers), ready to attach to a response
    pub fn header_map(&self) -> HeaderMap {
        let entries = self.header_entries();
        let mut map = HeaderMap::with_capacity(entries.len());
        for (_, name, value) in entries {
            // Header values built from integers are always valid
            if let Ok(value) = HeaderValue::from_str(&value) {
                map.insert(name, value);
            }
        }
        map
    }

    fn header_entries(&self) -> [(&'static str, HeaderName, String); 4] {
        let retry_after = if self.allowed {
            0
        } else {
            self.retry_after.as_secs_f64().ceil() as u64
        };

        [
            (
                HEADER_LIMIT,
                HeaderName::from_static("x-ratelimit-limit"),
                self.limit.to_string(),
            ),
            (
                HEADER_REMAINING,
                HeaderName::from_static("x-ratelimit-remaining"),
                self.remaining.to_string(),
            ),
            (
                HEADER_RESET,
                HeaderName::from_static("x-ratelimit-reset"),
                self.reset_at.timestamp().to_string(),
            ),
            (HEADER_RETRY_AFTER, header::RETRY_AFTER, retry_after.to_string()),
        ]
    }
}
