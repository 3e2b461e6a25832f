use std::{collections::VecDeque, time::Duration};

use super::StrategyKind;
use crate::{
    clock::Clock,
    error::Result,
    result::RateLimitResult,
    store::{StorageBackend, StoreValue},
    utils::{duration_from_secs, seconds_after},
};

pub const SUFFIX: &str = "swl";

/// Admit a request if fewer than `limit` accepted requests fall within the
/// trailing `window`. Entries at or before `now - window` are trimmed first.
pub fn check(
    store: &dyn StorageBackend,
    clock: &dyn Clock,
    key: &str,
    limit: u64,
    window: Duration,
) -> Result<RateLimitResult> {
    let store_key = format!("{}:{}", key, SUFFIX);
    let window_secs = window.as_secs_f64();

    let (allowed, retained, oldest, newest, now) = {
        let _section = store.lock(&store_key)?;
        let now = clock.monotonic();
        let cutoff = now - window_secs;

        let mut log = match store.get(&store_key)? {
            Some(StoreValue::Log(log)) => log,
            _ => VecDeque::new(),
        };
        while log.front().is_some_and(|&at| at <= cutoff) {
            log.pop_front();
        }

        let allowed = (log.len() as u64) < limit;
        if allowed {
            log.push_back(now);
        }

        let retained = log.len() as u64;
        let oldest = log.front().copied();
        let newest = log.back().copied();
        store.set(&store_key, StoreValue::Log(log), Some(window))?;
        (allowed, retained, oldest, newest, now)
    };

    let retry_after = match (allowed, oldest) {
        (false, Some(oldest)) => duration_from_secs(oldest + window_secs - now),
        _ => Duration::ZERO,
    };
    let until_reset = newest.map_or(0.0, |newest| newest + window_secs - now);

    Ok(RateLimitResult {
        allowed,
        key: key.to_string(),
        remaining: limit.saturating_sub(retained),
        limit,
        reset_at: seconds_after(clock.now(), until_reset),
        retry_after,
        strategy: StrategyKind::SlidingWindowLog,
    })
}
