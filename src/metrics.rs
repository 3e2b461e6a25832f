use prometheus::{Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the rate limit engine
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Check metrics
    checks: CounterVec,
    check_duration: HistogramVec,
    backend_errors: CounterVec,
    resets: Counter,

    // Service metrics
    config_load_success: Counter,
    config_load_error: Counter,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let checks = CounterVec::new(
            Opts::new(
                "ratelimit_checks_total",
                "Rate limit checks by strategy and outcome",
            ),
            &["strategy", "outcome"],
        )?;

        let check_duration = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_check_duration_seconds",
                "Duration of rate limit checks in seconds",
            ),
            &["strategy"],
        )?;

        let backend_errors = CounterVec::new(
            Opts::new(
                "ratelimit_backend_errors_total",
                "Number of checks that failed in the storage backend",
            ),
            &["strategy"],
        )?;

        let resets = Counter::new("ratelimit_resets_total", "Number of key resets")?;

        let config_load_success = Counter::new(
            "ratelimit_config_load_success",
            "Number of successful configuration loads",
        )?;

        let config_load_error = Counter::new(
            "ratelimit_config_load_error",
            "Number of failed configuration loads",
        )?;

        registry.register(Box::new(checks.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;
        registry.register(Box::new(backend_errors.clone()))?;
        registry.register(Box::new(resets.clone()))?;
        registry.register(Box::new(config_load_success.clone()))?;
        registry.register(Box::new(config_load_error.clone()))?;

        Ok(Self {
            registry,
            checks,
            check_duration,
            backend_errors,
            resets,
            config_load_success,
            config_load_error,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of a check
    pub fn record_check(&self, strategy: &str, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.checks.with_label_values(&[strategy, outcome]).inc();
    }

    /// Start a timer observing check duration; records when dropped
    pub fn start_check_timer(&self, strategy: &str) -> prometheus::HistogramTimer {
        self.check_duration.with_label_values(&[strategy]).start_timer()
    }

    pub fn record_backend_error(&self, strategy: &str) {
        self.backend_errors.with_label_values(&[strategy]).inc();
    }

    pub fn record_reset(&self) {
        self.resets.inc();
    }

    /// Record successful configuration load
    pub fn record_config_load_success(&self) {
        self.config_load_success.inc();
    }

    /// Record failed configuration load
    pub fn record_config_load_error(&self) {
        self.config_load_error.inc();
    }
}
