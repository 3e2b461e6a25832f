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

pub const SUFFIX: &str = "lb";

/// Persisted leaky bucket state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakyState {
    /// Always within `0..=limit`
    pub queue_size: u64,
    /// Monotonic seconds of the last drain that released at least one unit
    pub last_leak: f64,
}

/// Queue of capacity `limit` draining at `limit / window` requests per second.
///
/// Only whole units drain, and `last_leak` moves to `now` only when one
/// did. Time short of a whole unit accumulates across calls; the leftover
/// after a drain is discarded.
pub fn check(
    store: &dyn StorageBackend,
    clock: &dyn Clock,
    key: &str,
    limit: u64,
    window: Duration,
) -> Result<RateLimitResult> {
    let store_key = format!("{}:{}", key, SUFFIX);
    let rate = limit as f64 / window.as_secs_f64();

    let (allowed, queue_size) = {
        let _section = store.lock(&store_key)?;
        let now = clock.monotonic();

        let mut state = match store.get(&store_key)? {
            Some(StoreValue::LeakyBucket(state)) => state,
            _ => LeakyState {
                queue_size: 0,
                last_leak: now,
            },
        };

        let elapsed = (now - state.last_leak).max(0.0);
        let leaked = (elapsed * rate).floor() as u64;
        if leaked > 0 {
            state.queue_size = state.queue_size.saturating_sub(leaked);
            state.last_leak = now;
        }

        let allowed = state.queue_size < limit;
        if allowed {
            state.queue_size += 1;
        }

        store.set(&store_key, StoreValue::LeakyBucket(state), Some(window.saturating_mul(2)))?;
        (allowed, state.queue_size)
    };

    let retry_after = if allowed {
        Duration::ZERO
    } else {
        duration_from_secs(1.0 / rate)
    };

    Ok(RateLimitResult {
        allowed,
        key: key.to_string(),
        remaining: limit.saturating_sub(queue_size),
        limit,
        reset_at: seconds_after(clock.now(), queue_size as f64 / rate),
        retry_after,
        strategy: StrategyKind::LeakyBucket,
    })
}
