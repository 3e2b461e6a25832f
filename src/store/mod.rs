//! Key/value storage with per-key TTL backing every strategy.
//!
//! Strategies only touch shared state through [`StorageBackend`]: single
//! operations are atomic, and read-modify-write sequences run inside the
//! [`CriticalSection`] returned by [`StorageBackend::lock`].

pub mod memory;
pub mod redis;

use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, time::Duration};

use crate::{
    error::Result,
    strategy::{leaky_bucket::LeakyState, token_bucket::BucketState},
};

pub use self::memory::MemoryStore;
pub use self::redis::{RedisConfig, RedisStore};

/// Value persisted under a store key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreValue {
    /// Fixed-window slot counter
    Counter(i64),
    /// Accepted request timestamps, oldest first
    Log(VecDeque<f64>),
    TokenBucket(BucketState),
    LeakyBucket(LeakyState),
}

/// Storage contract shared by the local and distributed backends.
///
/// `get` and `incr` on an expired key behave as if the key were absent.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StoreValue>>;

    /// Store a value. With `ttl = None` an existing expiry is kept.
    fn set(&self, key: &str, value: StoreValue, ttl: Option<Duration>) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Atomically increment a counter and return the new value.
    ///
    /// The TTL is applied only when the counter is created, so repeated
    /// increments never extend a running window.
    fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64>;

    /// Enter the critical section for `key`.
    ///
    /// Sections on the same key are mutually exclusive. Implementations may
    /// widen the scope (one section per backend) since sections are brief.
    fn lock(&self, key: &str) -> Result<CriticalSection<'_>>;

    fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

trait Held {}

impl<T> Held for T {}

/// Scoped critical section; released when dropped
#[must_use = "the critical section is released as soon as the guard is dropped"]
pub struct CriticalSection<'a> {
    _guard: Box<dyn Held + 'a>,
}

impl<'a> CriticalSection<'a> {
    /// Wrap a backend-specific guard whose `Drop` releases the section
    pub fn new<G: 'a>(guard: G) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}
