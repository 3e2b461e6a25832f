use ::redis::{Client, Commands, Connection, RedisResult, Script};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, Instant},
};
use tracing::{info, warn};

use super::{CriticalSection, StorageBackend, StoreValue};
use crate::error::{RateLimitError, Result};

/// Increment, applying the TTL only when the counter is created
const INCR_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 and tonumber(ARGV[1]) > 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Delete the lock only if this holder still owns it
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Pause between lock acquisition attempts
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Redis backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Lease on a critical section; bounds how long a crashed holder blocks others
    pub lock_ttl_ms: u64,
    /// How long `lock` waits before reporting the backend unavailable
    pub lock_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout_ms: 5000,
            command_timeout_ms: 1000,
            lock_ttl_ms: 2000,
            lock_timeout_ms: 1000,
        }
    }
}

/// Shared backend on a Redis server.
///
/// Lets several processes enforce one set of limits. Values are stored as
/// JSON, except counters which stay native Redis integers. Critical sections
/// are `SET NX PX` leases released by a token check.
pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<Connection>>,
    config: RedisConfig,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a PING
    pub fn connect(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis store for URL: {}", config.url);

        let client = Client::open(config.url.as_str()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::from(e)
        })?;

        let store = Self {
            client,
            connection: Mutex::new(None),
            config,
        };
        store.health_check()?;

        info!("Redis store initialized successfully");
        Ok(store)
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    fn open_connection(&self) -> RedisResult<Connection> {
        let conn = self
            .client
            .get_connection_with_timeout(Duration::from_millis(self.config.connection_timeout_ms))?;
        let command_timeout = Some(Duration::from_millis(self.config.command_timeout_ms));
        conn.set_read_timeout(command_timeout)?;
        conn.set_write_timeout(command_timeout)?;
        Ok(conn)
    }

    /// Run a command on the shared connection, reconnecting after I/O failures
    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> RedisResult<T>) -> Result<T> {
        let mut slot = self.connection.lock();
        if slot.is_none() {
            *slot = Some(self.open_connection()?);
        }

        let conn = match slot.as_mut() {
            Some(conn) => conn,
            None => return Err(RateLimitError::BackendUnavailable("no Redis connection".into())),
        };

        match op(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    warn!("Dropping Redis connection after error: {}", e);
                    *slot = None;
                }
                Err(e.into())
            }
        }
    }

    fn lock_key(key: &str) -> String {
        format!("{}:lock", key)
    }

    fn release(&self, lock_key: &str, token: &str) {
        let result = self.with_connection(|conn| {
            Script::new(RELEASE_SCRIPT)
                .key(lock_key)
                .arg(token)
                .invoke::<i64>(conn)
        });
        if let Err(e) = result {
            warn!("Failed to release Redis lock {}: {}", lock_key, e);
        }
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn decode(raw: &str) -> Result<StoreValue> {
    if let Ok(count) = raw.parse::<i64>() {
        return Ok(StoreValue::Counter(count));
    }
    Ok(serde_json::from_str(raw)?)
}

fn encode(value: &StoreValue) -> Result<String> {
    match value {
        StoreValue::Counter(count) => Ok(count.to_string()),
        other => Ok(serde_json::to_string(other)?),
    }
}

impl StorageBackend for RedisStore {
    fn get(&self, key: &str) -> Result<Option<StoreValue>> {
        let raw: Option<String> = self.with_connection(|conn| conn.get(key))?;
        raw.as_deref().map(decode).transpose()
    }

    fn set(&self, key: &str, value: StoreValue, ttl: Option<Duration>) -> Result<()> {
        let payload = encode(&value)?;
        self.with_connection(|conn| {
            let mut cmd = ::redis::cmd("SET");
            cmd.arg(key).arg(&payload);
            match ttl {
                Some(ttl) => cmd.arg("PX").arg(ttl_millis(ttl)),
                None => cmd.arg("KEEPTTL"),
            };
            cmd.query::<()>(conn)
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| conn.del::<_, ()>(key))
    }

    fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let ttl_ms = ttl.map(ttl_millis).unwrap_or(0);
        self.with_connection(|conn| {
            Script::new(INCR_SCRIPT)
                .key(key)
                .arg(ttl_ms)
                .invoke::<i64>(conn)
        })
    }

    fn lock(&self, key: &str) -> Result<CriticalSection<'_>> {
        let lock_key = Self::lock_key(key);
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + Duration::from_millis(self.config.lock_timeout_ms);

        loop {
            let acquired: Option<String> = self.with_connection(|conn| {
                ::redis::cmd("SET")
                    .arg(&lock_key)
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(self.config.lock_ttl_ms)
                    .query(conn)
            })?;

            if acquired.is_some() {
                return Ok(CriticalSection::new(RedisLease {
                    store: self,
                    lock_key,
                    token,
                }));
            }

            if Instant::now() >= deadline {
                return Err(RateLimitError::BackendUnavailable(format!(
                    "timed out acquiring Redis lock {}",
                    lock_key
                )));
            }
            std::thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }

    fn health_check(&self) -> Result<()> {
        self.with_connection(|conn| ::redis::cmd("PING").query::<()>(conn))
    }
}

/// Held Redis lock; released on drop
struct RedisLease<'a> {
    store: &'a RedisStore,
    lock_key: String,
    token: String,
}

impl Drop for RedisLease<'_> {
    fn drop(&mut self) {
        self.store.release(&self.lock_key, &self.token);
    }
}
