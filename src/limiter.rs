use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    error::{RateLimitError, RateLimitExceeded, Result},
    metrics::Metrics,
    result::RateLimitResult,
    store::{MemoryStore, StorageBackend},
    strategy::{leaky_bucket, sliding_window, token_bucket, StrategyKind},
    utils::{build_store_key, fixed_window_key, seconds_after, slot_index, unix_seconds},
};

pub const DEFAULT_LIMIT: u64 = 100;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_KEY_PREFIX: &str = "rl";

/// Fixed-window slots cleared by `reset`: the current one and two before it
const RESET_SLOT_DEPTH: i64 = 3;

/// What `check` reports when the storage backend fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Deny the request
    #[default]
    FailClosed,
    /// Allow the request
    FailOpen,
}

/// Single rate limiter: one strategy applied to one store.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    limit: u64,
    window: Duration,
    strategy: StrategyKind,
    key_prefix: String,
    failure_mode: FailureMode,
    store: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
}

impl RateLimiter {
    /// Create a limiter backed by a fresh in-memory store
    pub fn new(limit: u64, window: Duration, strategy: StrategyKind) -> Result<Self> {
        Self::builder()
            .limit(limit)
            .window(window)
            .strategy(strategy)
            .build()
    }

    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    pub fn limit(&self) -> u64 {
        self.inner.limit
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    pub fn strategy(&self) -> StrategyKind {
        self.inner.strategy
    }

    pub fn key_prefix(&self) -> &str {
        &self.inner.key_prefix
    }

    pub fn store(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.store
    }

    /// Check the rate limit for `key`, consuming capacity when allowed.
    ///
    /// Never fails: a backend failure is logged and resolved through the
    /// configured [`FailureMode`].
    pub fn check(&self, key: &str) -> RateLimitResult {
        match self.try_check(key) {
            Ok(result) => result,
            Err(e) => self.fallback(key, &e),
        }
    }

    /// Like [`check`](Self::check), but surfaces backend failures
    pub fn try_check(&self, key: &str) -> Result<RateLimitResult> {
        let inner = &self.inner;
        let strategy = inner.strategy.as_str();
        let _timer = inner.metrics.as_ref().map(|m| m.start_check_timer(strategy));

        let store_key = build_store_key(&inner.key_prefix, key);
        let outcome = inner.strategy.check(
            inner.store.as_ref(),
            inner.clock.as_ref(),
            &store_key,
            inner.limit,
            inner.window,
        );

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                if let Some(metrics) = &inner.metrics {
                    metrics.record_backend_error(strategy);
                }
                return Err(e);
            }
        };
        result.key = key.to_string();

        if let Some(metrics) = &inner.metrics {
            metrics.record_check(strategy, result.allowed);
        }
        if !result.allowed {
            warn!(
                key = %key,
                strategy = %result.strategy,
                retry_after = result.retry_after.as_secs_f64(),
                "Rate limit hit"
            );
        }
        Ok(result)
    }

    /// Check the rate limit and fail with [`RateLimitError::Exceeded`] when denied.
    ///
    /// Backend failures are returned as-is so the caller can choose to fail
    /// open or closed.
    pub fn enforce(&self, key: &str) -> Result<RateLimitResult> {
        let result = self.try_check(key)?;
        if result.allowed {
            Ok(result)
        } else {
            Err(RateLimitExceeded::from_result(result).into())
        }
    }

    /// Suspendable variant of [`check`](Self::check).
    ///
    /// The critical section runs on the blocking pool. Dropping the returned
    /// future discards the result but never interrupts a mutation.
    pub async fn async_check(&self, key: &str) -> RateLimitResult {
        match self.try_async_check(key).await {
            Ok(result) => result,
            Err(e) => self.fallback(key, &e),
        }
    }

    pub async fn try_async_check(&self, key: &str) -> Result<RateLimitResult> {
        let limiter = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || limiter.try_check(&key))
            .await
            .map_err(|e| RateLimitError::BackendUnavailable(format!("rate limit worker failed: {}", e)))?
    }

    /// Suspendable variant of [`enforce`](Self::enforce)
    pub async fn async_enforce(&self, key: &str) -> Result<RateLimitResult> {
        let result = self.try_async_check(key).await?;
        if result.allowed {
            Ok(result)
        } else {
            Err(RateLimitExceeded::from_result(result).into())
        }
    }

    /// Run `f` only if `key` is within its limit
    pub fn throttle<T>(&self, key: &str, f: impl FnOnce() -> T) -> Result<T> {
        self.enforce(key)?;
        Ok(f())
    }

    /// Await `fut` only if `key` is within its limit
    pub async fn throttle_async<F: Future>(&self, key: &str, fut: F) -> Result<F::Output> {
        self.async_enforce(key).await?;
        Ok(fut.await)
    }

    /// Clear stored state for `key` across every strategy.
    ///
    /// Fixed-window counters are indexed by slot, and only the current slot
    /// and the two preceding ones are cleared. Older slots are never read
    /// again and expire through their TTL.
    pub fn reset(&self, key: &str) -> Result<()> {
        let inner = &self.inner;
        let store_key = build_store_key(&inner.key_prefix, key);

        for suffix in [sliding_window::SUFFIX, token_bucket::SUFFIX, leaky_bucket::SUFFIX] {
            inner.store.delete(&format!("{}:{}", store_key, suffix))?;
        }

        let current = slot_index(unix_seconds(inner.clock.now()), inner.window);
        for offset in 0..RESET_SLOT_DEPTH {
            inner.store.delete(&fixed_window_key(&store_key, current - offset))?;
        }

        if let Some(metrics) = &inner.metrics {
            metrics.record_reset();
        }
        debug!(key = %key, "Rate limit state reset");
        Ok(())
    }

    /// Health check for the underlying store
    pub fn health_check(&self) -> Result<()> {
        self.inner.store.health_check()
    }

    fn fallback(&self, key: &str, err: &RateLimitError) -> RateLimitResult {
        let inner = &self.inner;
        error!(
            key = %key,
            strategy = %inner.strategy,
            failure_mode = ?inner.failure_mode,
            "Rate limit check failed: {}", err
        );

        let allowed = inner.failure_mode == FailureMode::FailOpen;
        RateLimitResult {
            allowed,
            key: key.to_string(),
            remaining: if allowed { inner.limit } else { 0 },
            limit: inner.limit,
            reset_at: seconds_after(inner.clock.now(), inner.window.as_secs_f64()),
            retry_after: if allowed { Duration::ZERO } else { inner.window },
            strategy: inner.strategy,
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("strategy", &self.inner.strategy.as_str())
            .field("limit", &self.inner.limit)
            .field("window", &self.inner.window)
            .field("key_prefix", &self.inner.key_prefix)
            .finish()
    }
}

/// Builder for [`RateLimiter`]; validation happens in [`build`](Self::build)
pub struct RateLimiterBuilder {
    limit: u64,
    window: Duration,
    strategy: StrategyKind,
    key_prefix: String,
    failure_mode: FailureMode,
    store: Option<Arc<dyn StorageBackend>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<Metrics>>,
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window: DEFAULT_WINDOW,
            strategy: StrategyKind::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            failure_mode: FailureMode::default(),
            store: None,
            clock: None,
            metrics: None,
        }
    }
}

impl RateLimiterBuilder {
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    /// Share a store between limiters. Defaults to a new [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn StorageBackend>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<RateLimiter> {
        if self.limit == 0 {
            return Err(RateLimitError::Config(
                "Rate limit must be greater than zero".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(RateLimitError::Config(
                "Rate limit window must be greater than zero".to_string(),
            ));
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::with_clock(clock.clone())) as Arc<dyn StorageBackend>);

        info!(
            strategy = %self.strategy,
            limit = self.limit,
            window_secs = self.window.as_secs_f64(),
            key_prefix = %self.key_prefix,
            "Rate limiter created"
        );

        Ok(RateLimiter {
            inner: Arc::new(Inner {
                limit: self.limit,
                window: self.window,
                strategy: self.strategy,
                key_prefix: self.key_prefix,
                failure_mode: self.failure_mode,
                store,
                clock,
                metrics: self.metrics,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, store::CriticalSection, store::StoreValue};

    fn limiter(strategy: StrategyKind, limit: u64, window_secs: u64) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::starting_at(1_000.0));
        let limiter = RateLimiter::builder()
            .limit(limit)
            .window(Duration::from_secs(window_secs))
            .strategy(strategy)
            .clock(clock.clone())
            .build()
            .unwrap();
        (clock, limiter)
    }

    /// Store whose every operation fails, standing in for a lost Redis
    struct UnavailableStore;

    impl StorageBackend for UnavailableStore {
        fn get(&self, _key: &str) -> Result<Option<StoreValue>> {
            Err(RateLimitError::BackendUnavailable("down".into()))
        }
        fn set(&self, _key: &str, _value: StoreValue, _ttl: Option<Duration>) -> Result<()> {
            Err(RateLimitError::BackendUnavailable("down".into()))
        }
        fn delete(&self, _key: &str) -> Result<()> {
            Err(RateLimitError::BackendUnavailable("down".into()))
        }
        fn incr(&self, _key: &str, _ttl: Option<Duration>) -> Result<i64> {
            Err(RateLimitError::BackendUnavailable("down".into()))
        }
        fn lock(&self, _key: &str) -> Result<CriticalSection<'_>> {
            Err(RateLimitError::BackendUnavailable("down".into()))
        }
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let err = RateLimiter::new(0, Duration::from_secs(1), StrategyKind::FixedWindow).unwrap_err();
        assert!(matches!(err, RateLimitError::Config(_)));

        let err = RateLimiter::new(5, Duration::ZERO, StrategyKind::TokenBucket).unwrap_err();
        assert!(matches!(err, RateLimitError::Config(_)));
    }

    #[test]
    fn test_defaults() {
        let limiter = RateLimiter::builder().build().unwrap();
        assert_eq!(limiter.limit(), 100);
        assert_eq!(limiter.window(), Duration::from_secs(60));
        assert_eq!(limiter.strategy(), StrategyKind::SlidingWindowLog);
        assert_eq!(limiter.key_prefix(), "rl");
        assert!(format!("{:?}", limiter).contains("sliding_window_log"));
    }

    #[test]
    fn test_check_reports_raw_key() {
        let (_clock, limiter) = limiter(StrategyKind::TokenBucket, 2, 10);
        let result = limiter.check("user:42");
        assert_eq!(result.key, "user:42");
        assert_eq!(result.strategy, StrategyKind::TokenBucket);
    }

    #[test]
    fn test_enforce_raises_with_details() {
        let (_clock, limiter) = limiter(StrategyKind::SlidingWindowLog, 1, 30);
        assert!(limiter.enforce("k").is_ok());

        let err = limiter.enforce("k").unwrap_err();
        let exceeded = err.as_exceeded().expect("rate limit denial");
        assert_eq!(exceeded.key, "k");
        assert_eq!(exceeded.limit, 1);
        assert_eq!(exceeded.strategy, StrategyKind::SlidingWindowLog);
        assert_eq!(exceeded.retry_after, Duration::from_secs(30));
        assert!(!exceeded.result.allowed);
    }

    #[test]
    fn test_keys_are_isolated() {
        let (_clock, limiter) = limiter(StrategyKind::FixedWindow, 1, 60);
        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
    }

    #[test]
    fn test_reset_restores_full_capacity() {
        for strategy in StrategyKind::ALL {
            let (_clock, limiter) = limiter(strategy, 3, 60);
            for _ in 0..4 {
                limiter.check("k");
            }
            limiter.reset("k").unwrap();

            let result = limiter.check("k");
            assert!(result.allowed, "{} not allowed after reset", strategy);
            assert_eq!(result.remaining, 2, "{} remaining after reset", strategy);
        }
    }

    #[test]
    fn test_window_near_duration_max_does_not_panic() {
        for strategy in StrategyKind::ALL {
            let limiter = RateLimiter::builder()
                .limit(1)
                .window(Duration::MAX)
                .strategy(strategy)
                .clock(Arc::new(ManualClock::starting_at(1_000.0)))
                .build()
                .unwrap();

            assert!(limiter.check("k").allowed, "{}", strategy);
            assert!(!limiter.check("k").allowed, "{}", strategy);
            limiter.reset("k").unwrap();
        }
    }

    #[test]
    fn test_throttle_runs_only_when_allowed() {
        let (_clock, limiter) = limiter(StrategyKind::LeakyBucket, 1, 10);
        assert_eq!(limiter.throttle("k", || 7).unwrap(), 7);

        let mut ran = false;
        let err = limiter.throttle("k", || ran = true).unwrap_err();
        assert!(err.as_exceeded().is_some());
        assert!(!ran);
    }

    #[test]
    fn test_backend_failure_policy() {
        let closed = RateLimiter::builder()
            .limit(5)
            .store(Arc::new(UnavailableStore))
            .strategy(StrategyKind::TokenBucket)
            .build()
            .unwrap();
        let result = closed.check("k");
        assert!(!result.allowed);
        assert_eq!(result.retry_after, closed.window());

        let err = closed.enforce("k").unwrap_err();
        assert!(err.is_backend_failure());
        assert!(err.as_exceeded().is_none());

        let open = RateLimiter::builder()
            .limit(5)
            .store(Arc::new(UnavailableStore))
            .failure_mode(FailureMode::FailOpen)
            .build()
            .unwrap();
        let result = open.check("k");
        assert!(result.allowed);
        assert_eq!(result.remaining, 5);
        assert_eq!(result.retry_after, Duration::ZERO);
    }

    #[test]
    fn test_metrics_recorded() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let limiter = RateLimiter::builder()
            .limit(1)
            .strategy(StrategyKind::FixedWindow)
            .metrics(metrics.clone())
            .build()
            .unwrap();
        limiter.check("k");
        limiter.check("k");

        let families = metrics.registry().gather();
        let checks = families
            .iter()
            .find(|f| f.get_name() == "ratelimit_checks_total")
            .unwrap();
        let total: f64 = checks.get_metric().iter().map(|m| m.get_counter().get_value()).sum();
        assert_eq!(total, 2.0);
    }

    #[tokio::test]
    async fn test_async_check_matches_sync_contract() {
        let (_clock, limiter) = limiter(StrategyKind::TokenBucket, 2, 10);
        assert!(limiter.async_check("k").await.allowed);
        assert!(limiter.async_enforce("k").await.is_ok());

        let denied = limiter.async_check("k").await;
        assert!(!denied.allowed);
        assert!(limiter.async_enforce("k").await.unwrap_err().as_exceeded().is_some());
    }

    #[tokio::test]
    async fn test_throttle_async() {
        let (_clock, limiter) = limiter(StrategyKind::FixedWindow, 1, 10);
        let value = limiter.throttle_async("k", async { "done" }).await.unwrap();
        assert_eq!(value, "done");
        assert!(limiter.throttle_async("k", async { "late" }).await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_async_checks_still_complete() {
        let (_clock, limiter) = limiter(StrategyKind::TokenBucket, 5, 60);
        let state_key = format!(
            "{}:{}",
            build_store_key(limiter.key_prefix(), "k"),
            token_bucket::SUFFIX
        );

        // Each future is polled once, handing the check to the blocking
        // pool, and dropped before the result comes back
        for _ in 0..3 {
            let _ = tokio::time::timeout(Duration::ZERO, limiter.async_check("k")).await;
        }

        let store = limiter.store().clone();
        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match store.get(&state_key) {
                    Ok(Some(StoreValue::TokenBucket(state))) if state.tokens == 2.0 => break state,
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        })
        .await
        .expect("dropped checks did not finish their update");
        assert_eq!(settled.last_refill, 1_000.0);

        let admitted = (0..10).filter(|_| limiter.check("k").allowed).count();
        assert_eq!(admitted, 2);
    }
}
