use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{fmt, time::{Duration, Instant}};

use crate::utils::{datetime_from_unix, unix_seconds};

/// Time source for rate limiting calculations.
///
/// Strategies read two timelines: wall-clock time for aligned slots and
/// reported reset timestamps, and a monotonic timeline for every interval
/// computation (refill, drain, log trimming, TTL expiry).
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Seconds on a timeline that never goes backwards
    fn monotonic(&self) -> f64;
}

/// Clock backed by the operating system.
///
/// The monotonic timeline is anchored at the Unix time the clock was
/// created, so values written by different processes into a shared
/// backend stay comparable up to their clock skew.
pub struct SystemClock {
    anchor_unix: f64,
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor_unix: unix_seconds(Utc::now()),
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemClock").finish_non_exhaustive()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> f64 {
        self.anchor_unix + self.anchor.elapsed().as_secs_f64()
    }
}

/// Manually driven clock for tests and simulations.
///
/// Both timelines read the same value, expressed as seconds since the
/// Unix epoch. Time only moves when `advance` or `set` is called.
#[derive(Debug, Default)]
pub struct ManualClock {
    seconds: Mutex<f64>,
}

impl ManualClock {
    /// Clock frozen at the Unix epoch
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(seconds: f64) -> Self {
        Self {
            seconds: Mutex::new(seconds),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.seconds.lock() += by.as_secs_f64();
    }

    /// Jump to an absolute time. Moving backwards is ignored.
    pub fn set(&self, seconds: f64) {
        let mut current = self.seconds.lock();
        if seconds > *current {
            *current = seconds;
        }
    }

    pub fn seconds(&self) -> f64 {
        *self.seconds.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        datetime_from_unix(self.seconds())
    }

    fn monotonic(&self) -> f64 {
        self.seconds()
    }
}
