use std::time::Duration;

use super::StrategyKind;
use crate::{
    clock::Clock,
    error::Result,
    result::RateLimitResult,
    store::StorageBackend,
    utils::{datetime_from_unix, duration_from_secs, fixed_window_key, slot_index, slot_reset, unix_seconds},
};

/// Count requests per aligned slot of `window` seconds.
///
/// Slots are aligned to wall-clock time so `reset_at` is a real timestamp.
/// A burst straddling two slots can admit close to `2 * limit` requests in
/// a short span; that is a property of the algorithm and is kept.
pub fn check(
    store: &dyn StorageBackend,
    clock: &dyn Clock,
    key: &str,
    limit: u64,
    window: Duration,
) -> Result<RateLimitResult> {
    let now = unix_seconds(clock.now());
    let slot = slot_index(now, window);

    let count = store.incr(&fixed_window_key(key, slot), Some(window))?;
    let count = count.max(0) as u64;

    let reset_at = slot_reset(slot, window);
    let allowed = count <= limit;

    Ok(RateLimitResult {
        allowed,
        key: key.to_string(),
        remaining: limit.saturating_sub(count),
        limit,
        reset_at: datetime_from_unix(reset_at),
        retry_after: if allowed {
            Duration::ZERO
        } else {
            duration_from_secs(reset_at - now)
        },
        strategy: StrategyKind::FixedWindow,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, store::MemoryStore};
    use std::sync::Arc;

    fn setup() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new());
        (clock.clone(), MemoryStore::with_clock(clock))
    }

    #[test]
    fn test_counts_within_slot() {
        let (clock, store) = setup();
        let window = Duration::from_secs(60);

        let first = check(&store, clock.as_ref(), "k", 2, window).unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.reset_at.timestamp(), 60);

        let second = check(&store, clock.as_ref(), "k", 2, window).unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        clock.advance(Duration::from_secs(10));
        let third = check(&store, clock.as_ref(), "k", 2, window).unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.retry_after, Duration::from_secs(50));
    }

    #[test]
    fn test_new_slot_starts_fresh() {
        let (clock, store) = setup();
        let window = Duration::from_secs(10);
        for _ in 0..3 {
            check(&store, clock.as_ref(), "k", 3, window).unwrap();
        }
        assert!(!check(&store, clock.as_ref(), "k", 3, window).unwrap().allowed);

        clock.advance(Duration::from_secs(10));
        let result = check(&store, clock.as_ref(), "k", 3, window).unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
        assert_eq!(result.reset_at.timestamp(), 20);
    }
}
