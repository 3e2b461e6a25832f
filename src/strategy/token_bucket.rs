use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::StrategyKind;
use crate::{
    clock::Clock,
    error::Result,
    result::RateLimitResult,
    store::{StorageBackend, StoreValue},
    utils::{duration_from_secs, seconds_after},
};

pub const SUFFIX: &str = "tb";

/// Persisted token bucket state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Always within `0..=limit`
    pub tokens: f64,
    /// Monotonic seconds of the last refill
    pub last_refill: f64,
}

/// Bucket of `limit` tokens refilling at `limit / window` tokens per second.
///
/// State is kept for `2 * window` so an idle bucket is not dropped before
/// it has had time to refill completely.
pub fn check(
    store: &dyn StorageBackend,
    clock: &dyn Clock,
    key: &str,
    limit: u64,
    window: Duration,
) -> Result<RateLimitResult> {
    let store_key = format!("{}:{}", key, SUFFIX);
    let capacity = limit as f64;
    let rate = capacity / window.as_secs_f64();

    let (allowed, tokens) = {
        let _section = store.lock(&store_key)?;
        let now = clock.monotonic();

        let mut state = match store.get(&store_key)? {
            Some(StoreValue::TokenBucket(state)) => state,
            _ => BucketState {
                tokens: capacity,
                last_refill: now,
            },
        };

        let elapsed = (now - state.last_refill).max(0.0);
        state.tokens = (state.tokens + elapsed * rate).min(capacity);
        state.last_refill = now;

        let allowed = state.tokens >= 1.0;
        if allowed {
            state.tokens -= 1.0;
        }

        store.set(&store_key, StoreValue::TokenBucket(state), Some(window.saturating_mul(2)))?;
        (allowed, state.tokens)
    };

    let retry_after = if allowed {
        Duration::ZERO
    } else {
        duration_from_secs((1.0 - tokens) / rate)
    };

    Ok(RateLimitResult {
        allowed,
        key: key.to_string(),
        remaining: tokens.floor() as u64,
        limit,
        reset_at: seconds_after(clock.now(), (capacity - tokens) / rate),
        retry_after,
        strategy: StrategyKind::TokenBucket,
    })
}
