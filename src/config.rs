use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

use crate::{
    clock::{Clock, SystemClock},
    error::{RateLimitError, Result},
    limiter::{FailureMode, RateLimiter, DEFAULT_KEY_PREFIX},
    metrics::Metrics,
    store::{MemoryStore, RedisConfig, RedisStore, StorageBackend},
    strategy::StrategyKind,
    tiered::TieredRateLimiter,
};

/// Rate limit configuration: one or more tiers sharing a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub failure_mode: FailureMode,
    #[serde(default)]
    pub backend: BackendConfig,
    pub tiers: Vec<TierConfig>,
}

/// A single limiter in the tier list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: Option<String>,
    pub limit: u64,
    pub window_secs: f64,
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Overrides the derived `<key_prefix>:<name or index>` namespace
    pub key_prefix: Option<String>,
}

/// Storage backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    #[default]
    Memory,
    Redis(RedisConfig),
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl TierConfig {
    fn window(&self) -> Result<Duration> {
        if !self.window_secs.is_finite() || self.window_secs <= 0.0 {
            return Err(RateLimitError::Config(format!(
                "Tier window must be a positive number of seconds, got {}",
                self.window_secs
            )));
        }
        Duration::try_from_secs_f64(self.window_secs)
            .map_err(|e| RateLimitError::Config(format!("Invalid tier window: {}", e)))
    }
}

impl RateLimitConfig {
    /// Single-tier configuration with the in-memory backend
    pub fn single(limit: u64, window_secs: f64, strategy: StrategyKind) -> Self {
        Self {
            key_prefix: default_key_prefix(),
            failure_mode: FailureMode::default(),
            backend: BackendConfig::default(),
            tiers: vec![TierConfig {
                name: None,
                limit,
                window_secs,
                strategy,
                key_prefix: None,
            }],
        }
    }

    /// Validate without connecting to any backend
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(RateLimitError::Config(
                "At least one rate limiter tier is required".to_string(),
            ));
        }
        for (index, tier) in self.tiers.iter().enumerate() {
            if tier.limit == 0 {
                return Err(RateLimitError::Config(format!(
                    "Tier {} limit must be greater than zero",
                    index
                )));
            }
            tier.window()?;
        }
        Ok(())
    }

    /// Namespace for a tier so tiers sharing a backend never share state
    pub fn tier_prefix(&self, index: usize) -> String {
        let tier = &self.tiers[index];
        match (&tier.key_prefix, &tier.name) {
            (Some(prefix), _) => prefix.clone(),
            (None, Some(name)) => format!("{}:{}", self.key_prefix, name),
            (None, None) => format!("{}:{}", self.key_prefix, index),
        }
    }

    pub fn build(&self) -> Result<TieredRateLimiter> {
        self.build_with(Arc::new(SystemClock::new()), None)
    }

    /// Build the tiered limiter on the given clock, optionally recording metrics
    pub fn build_with(
        &self,
        clock: Arc<dyn Clock>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<TieredRateLimiter> {
        self.validate()?;

        let store: Arc<dyn StorageBackend> = match &self.backend {
            BackendConfig::Memory => Arc::new(MemoryStore::with_clock(clock.clone())),
            BackendConfig::Redis(redis) => Arc::new(RedisStore::connect(redis.clone())?),
        };

        let tiers = self
            .tiers
            .iter()
            .enumerate()
            .map(|(index, tier)| {
                let mut builder = RateLimiter::builder()
                    .limit(tier.limit)
                    .window(tier.window()?)
                    .strategy(tier.strategy)
                    .key_prefix(self.tier_prefix(index))
                    .failure_mode(self.failure_mode)
                    .store(store.clone())
                    .clock(clock.clone());
                if let Some(metrics) = &metrics {
                    builder = builder.metrics(metrics.clone());
                }
                builder.build()
            })
            .collect::<Result<Vec<_>>>()?;

        TieredRateLimiter::new(tiers)
    }
}

/// Load configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<RateLimitConfig> {
    serde_yaml::from_str(yaml)
        .map_err(|e| RateLimitError::Config(format!("Failed to parse YAML: {}", e)))
}

/// Load configuration from YAML file
pub fn load_config_from_file(path: &str) -> Result<RateLimitConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}

/// Load configuration from a file with `RATELIMIT__*` environment overrides,
/// e.g. `RATELIMIT__KEY_PREFIX=api` or `RATELIMIT__BACKEND__URL=redis://cache:6379`.
pub fn load_settings(path: &str) -> Result<RateLimitConfig> {
    config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(
            config::Environment::with_prefix("RATELIMIT")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .and_then(|settings| settings.try_deserialize())
        .map_err(|e| RateLimitError::Config(format!("Failed to load settings: {}", e)))
}
