use std::sync::Arc;

use analysis_core::MarketDataProvider;
use anyhow::Result;
use tokio::signal::unix::SignalKind;

use trading_agent::{AgentConfig, SqlStateStore, StateStore, SyntheticFeed, TradingEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting consensus trading engine");

    // 2. Configuration
    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Symbols: {}", config.symbols.join(", "));
    tracing::info!(
        "  Analysis every {}m on {:?} bars, monitor every {}s",
        config.analysis_interval_minutes,
        config.timeframe,
        config.monitor_interval_seconds
    );
    tracing::info!(
        "  Min consensus {:.0}%, min confidence {:.0}",
        config.consensus.min_consensus,
        config.consensus.min_confidence
    );
    tracing::info!(
        "  Breaker: {} losses, {}m cooldown | max {} trades/day",
        config.breaker.threshold,
        config.breaker.cooldown_minutes,
        config.max_daily_trades
    );
    tracing::info!("  Starting cash: {:.2}", config.initial_cash);

    // 3. Persistence (optional)
    let store: Option<Arc<dyn StateStore>> = match &config.database_url {
        Some(url) => {
            let store = SqlStateStore::connect(url).await?;
            tracing::info!("State store initialized ({})", url);
            Some(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, running without persistence");
            None
        }
    };

    // 4. Market data
    let seed: u64 = std::env::var("FEED_SEED")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(rand::random);
    let volatility: f64 = std::env::var("FEED_VOLATILITY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.004);
    let provider: Arc<dyn MarketDataProvider> = Arc::new(SyntheticFeed::new(seed, volatility));
    tracing::info!(
        "Synthetic market feed (seed {}, step volatility {})",
        seed,
        volatility
    );

    // 5. Engine
    let engine = TradingEngine::new(config, provider, store).await?;
    engine.start().await?;
    tracing::info!("Engine is now running. Press Ctrl+C to stop.");

    // 6. Wait for SIGINT / SIGTERM
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
    }

    tracing::info!("Shutdown signal received, stopping gracefully...");
    engine.stop().await?;

    let status = engine.get_status().await;
    tracing::info!(
        "Final equity {} (realized {}), {} open position(s)",
        status.equity,
        status.realized_pnl,
        status.open_positions.len()
    );
    tracing::info!("Trading engine shut down.");
    Ok(())
}
