//! Rate Limiting Engine
//!
//! Four throttling algorithms (fixed window, sliding window log, token
//! bucket, leaky bucket) behind a single limiter API, backed by a key-scoped
//! store with TTL semantics. Limiters can be composed into tiers that must
//! all admit a request.
//!
//! ```no_run
//! use std::time::Duration;
//! use ratelimit_engine::{RateLimiter, StrategyKind};
//!
//! let limiter = RateLimiter::new(100, Duration::from_secs(60), StrategyKind::TokenBucket)?;
//! let result = limiter.check("user:42");
//! if !result.allowed {
//!     println!("retry in {:?}", result.retry_after);
//! }
//! limiter.enforce("user:42")?;
//! # Ok::<(), ratelimit_engine::RateLimitError>(())
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod result;
pub mod service;
pub mod store;
pub mod strategy;
pub mod tiered;
pub mod utils;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config_from_file, load_config_from_yaml, RateLimitConfig};
pub use error::{RateLimitError, RateLimitExceeded, Result};
pub use limiter::{FailureMode, RateLimiter, RateLimiterBuilder};
pub use result::RateLimitResult;
pub use store::{MemoryStore, RedisConfig, RedisStore, StorageBackend, StoreValue};
pub use strategy::StrategyKind;
pub use tiered::TieredRateLimiter;
