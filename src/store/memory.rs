use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use super::{CriticalSection, StorageBackend, StoreValue};
use crate::{
    clock::{Clock, SystemClock},
    error::{RateLimitError, Result},
};

/// Number of independent critical sections; keys hash onto them
const SECTION_SHARDS: usize = 64;

struct StoreEntry {
    value: StoreValue,
    /// Absolute expiry on the clock's monotonic timeline
    expires_at: Option<f64>,
}

impl StoreEntry {
    fn is_expired(&self, now: f64) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Process-local store with lazy TTL expiry.
///
/// Expired entries are evicted when next touched; nothing sweeps them in
/// the background.
pub struct MemoryStore {
    entries: DashMap<String, StoreEntry>,
    sections: Box<[Mutex<()>]>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store whose TTLs are measured on the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            sections: (0..SECTION_SHARDS).map(|_| Mutex::new(())).collect(),
            clock,
        }
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expiry(&self, now: f64, ttl: Option<Duration>) -> Option<f64> {
        ttl.map(|ttl| now + ttl.as_secs_f64())
    }

    fn section_for(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.sections[(hasher.finish() as usize) % self.sections.len()]
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl StorageBackend for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoreValue>> {
        let now = self.clock.monotonic();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: StoreValue, ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.monotonic();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let expires_at = match ttl {
                    Some(_) => self.expiry(now, ttl),
                    None if occupied.get().is_expired(now) => None,
                    None => occupied.get().expires_at,
                };
                occupied.insert(StoreEntry { value, expires_at });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoreEntry {
                    value,
                    expires_at: self.expiry(now, ttl),
                });
            }
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let now = self.clock.monotonic();
        let fresh = || StoreEntry {
            value: StoreValue::Counter(1),
            expires_at: self.expiry(now, ttl),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh());
                    return Ok(1);
                }
                match &mut occupied.get_mut().value {
                    StoreValue::Counter(count) => {
                        *count += 1;
                        Ok(*count)
                    }
                    _ => Err(RateLimitError::Storage(format!(
                        "value at '{}' is not a counter",
                        key
                    ))),
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh());
                Ok(1)
            }
        }
    }

    fn lock(&self, key: &str) -> Result<CriticalSection<'_>> {
        Ok(CriticalSection::new(self.section_for(key).lock()))
    }
}
