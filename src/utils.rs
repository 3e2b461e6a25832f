use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Number of hex characters of the key digest kept in store keys
const FINGERPRINT_LEN: usize = 8;

/// Convert a wall-clock time to fractional Unix seconds
pub fn unix_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp() as f64 + f64::from(time.timestamp_subsec_nanos()) / 1e9
}

/// Convert fractional Unix seconds back to a wall-clock time
pub fn datetime_from_unix(seconds: f64) -> DateTime<Utc> {
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos).unwrap_or_default()
}

/// Wall-clock time `seconds` after `time`; negative offsets count as zero
pub fn seconds_after(time: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    datetime_from_unix(unix_seconds(time) + seconds.max(0.0))
}

/// Duration from seconds, clamping negative and NaN values to zero and
/// anything beyond `Duration::MAX` to `Duration::MAX`
pub fn duration_from_secs(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }
}

/// Short, stable fingerprint of a caller key
pub fn fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Build the namespaced store key for a caller key.
///
/// The fingerprint keeps keys containing the `:` delimiter from colliding,
/// the raw key keeps the store readable when debugging.
pub fn build_store_key(prefix: &str, key: &str) -> String {
    format!("{}:{}:{}", prefix, fingerprint(key), key)
}

/// Discrete fixed-window slot containing `now`
pub fn slot_index(now: f64, window: Duration) -> i64 {
    (now / window.as_secs_f64()).floor() as i64
}

/// Unix time at which the given slot ends
pub fn slot_reset(slot: i64, window: Duration) -> f64 {
    (slot + 1) as f64 * window.as_secs_f64()
}

/// Store key for a fixed-window slot counter
pub fn fixed_window_key(store_key: &str, slot: i64) -> String {
    format!("{}:fw:{}", store_key, slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_generation() {
        let key = build_store_key("rl", "user:42");
        let parts: Vec<&str> = key.splitn(3, ':').collect();
        assert_eq!(parts[0], "rl");
        assert_eq!(parts[1].len(), FINGERPRINT_LEN);
        assert_eq!(parts[2], "user:42");
        assert_eq!(key, build_store_key("rl", "user:42"));
    }

    #[test]
    fn test_fingerprint_separates_delimited_keys() {
        assert_ne!(fingerprint("a:b"), fingerprint("a"));
        assert_ne!(build_store_key("rl", "a:b"), build_store_key("rl:a", "b"));
    }

    #[test]
    fn test_slot_arithmetic() {
        let window = Duration::from_secs(60);
        assert_eq!(slot_index(0.0, window), 0);
        assert_eq!(slot_index(59.999, window), 0);
        assert_eq!(slot_index(60.0, window), 1);
        assert_eq!(slot_reset(0, window), 60.0);
        assert_eq!(fixed_window_key("rl:abc:k", 7), "rl:abc:k:fw:7");
    }

    #[test]
    fn test_time_conversions() {
        let time = datetime_from_unix(1_700_000_000.25);
        assert_eq!(time.timestamp(), 1_700_000_000);
        assert!((unix_seconds(time) - 1_700_000_000.25).abs() < 1e-6);
        assert_eq!(duration_from_secs(-3.0), Duration::ZERO);
        assert_eq!(duration_from_secs(f64::NAN), Duration::ZERO);
        assert_eq!(duration_from_secs(1.5), Duration::from_millis(1500));
        assert_eq!(duration_from_secs(f64::INFINITY), Duration::MAX);
        assert_eq!(duration_from_secs(Duration::MAX.as_secs_f64()), Duration::MAX);
    }
}
