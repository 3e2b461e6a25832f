use anyhow::Result;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratelimit_engine::{
    clock::SystemClock,
    config::{load_settings, RateLimitConfig},
    limiter::{DEFAULT_LIMIT, DEFAULT_WINDOW},
    metrics::Metrics,
    service::{router, AppState},
    strategy::StrategyKind,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ratelimit_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting rate limit engine");

    let metrics = Arc::new(Metrics::new()?);
    let config = load_config(&metrics)?;
    let limiter = config.build_with(Arc::new(SystemClock::new()), Some(metrics.clone()))?;
    info!("Configured {} rate limit tier(s)", limiter.tiers().len());

    let state = AppState::new(limiter, metrics);

    let http_addr = std::env::var("HTTP_PORT")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse::<SocketAddr>()?;

    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    tokio::select! {
        result = axum::serve(listener, router(state)) => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Service stopped");
    Ok(())
}

fn load_config(metrics: &Metrics) -> Result<RateLimitConfig> {
    let Ok(config_path) = std::env::var("CONFIG_PATH") else {
        info!("CONFIG_PATH not set, using a single in-memory sliding window tier");
        return Ok(RateLimitConfig::single(
            DEFAULT_LIMIT,
            DEFAULT_WINDOW.as_secs_f64(),
            StrategyKind::SlidingWindowLog,
        ));
    };

    info!("Loading configuration from: {}", config_path);
    match load_settings(&config_path) {
        Ok(config) => {
            metrics.record_config_load_success();
            info!("Configuration loaded successfully");
            Ok(config)
        }
        Err(e) => {
            metrics.record_config_load_error();
            Err(e.into())
        }
    }
}
