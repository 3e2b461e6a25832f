//! The four throttling algorithms.
//!
//! The set is closed: [`StrategyKind`] selects one at construction time and
//! dispatches exhaustively. Every algorithm funnels its reads and writes
//! through the [`StorageBackend`], which provides all of the atomicity.

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_window;
pub mod token_bucket;

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

use crate::{
    clock::Clock,
    error::{RateLimitError, Result},
    result::RateLimitResult,
    store::StorageBackend,
};

/// Rate limiting algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Counter per aligned slot; allows up to twice the limit across a slot boundary
    FixedWindow,
    /// Timestamp log over a trailing window; exact, memory grows with traffic
    #[default]
    SlidingWindowLog,
    /// Continuously refilling token pool; absorbs bursts up to the limit
    TokenBucket,
    /// Continuously draining queue; smooths bursts
    LeakyBucket,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::FixedWindow,
        StrategyKind::SlidingWindowLog,
        StrategyKind::TokenBucket,
        StrategyKind::LeakyBucket,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::FixedWindow => "fixed_window",
            StrategyKind::SlidingWindowLog => "sliding_window_log",
            StrategyKind::TokenBucket => "token_bucket",
            StrategyKind::LeakyBucket => "leaky_bucket",
        }
    }

    /// Run the algorithm for `key` against `store`.
    ///
    /// `key` is the already-namespaced store key; strategy state lives under
    /// `<key>:<suffix>`.
    pub fn check(
        self,
        store: &dyn StorageBackend,
        clock: &dyn Clock,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitResult> {
        match self {
            StrategyKind::FixedWindow => fixed_window::check(store, clock, key, limit, window),
            StrategyKind::SlidingWindowLog => sliding_window::check(store, clock, key, limit, window),
            StrategyKind::TokenBucket => token_bucket::check(store, clock, key, limit, window),
            StrategyKind::LeakyBucket => leaky_bucket::check(store, clock, key, limit, window),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| RateLimitError::Config(format!("Unknown strategy: {}", s)))
    }
}
