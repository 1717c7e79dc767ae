use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;

use analysis_core::Timeframe;
use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use consensus_engine::ConsensusConfig;
use portfolio_manager::ExecutionConfig;
use risk_manager::RiskConfig;
use serde::{Deserialize, Serialize};

/// Trailing stop / dynamic take-profit behaviour of the position supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Unrealized gain (percent) before the trailing stop engages
    pub trailing_activation_percent: f64,
    /// Trail distance (percent of price) when a position carries none
    pub default_trail_percent: f64,
    /// Share of the entry-to-target distance after which the target is pushed out
    pub take_profit_extension_trigger: f64,
    /// Extension size as a multiple of the position's trail distance
    pub take_profit_extension_multiple: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            trailing_activation_percent: 1.0,
            default_trail_percent: 2.0,
            take_profit_extension_trigger: 0.8,
            take_profit_extension_multiple: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown_minutes: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown_minutes: 60,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes)
    }
}

fn default_strategy_weights() -> BTreeMap<String, f64> {
    [
        ("momentum", 0.30),
        ("mean_reversion", 0.20),
        ("trend_following", 0.30),
        ("breakout", 0.20),
    ]
    .into_iter()
    .map(|(id, w)| (id.to_string(), w))
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Universe
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub bars_lookback: usize,

    // Scheduling
    pub analysis_interval_minutes: u64,
    pub monitor_interval_seconds: u64,
    pub strategy_timeout_ms: u64,
    /// Upper bound on a single `get_price` call.
    pub price_timeout_ms: u64,
    pub max_daily_trades: u32,
    /// IANA name; the trading day rolls over at local midnight.
    pub trading_timezone: String,

    // Portfolio
    pub initial_cash: f64,
    pub price_cache_ttl_seconds: u64,

    // Shutdown behaviour
    pub liquidate_on_shutdown: bool,
    pub liquidate_on_emergency: bool,

    pub metrics_log_interval_cycles: u64,
    /// None keeps state in memory only.
    pub database_url: Option<String>,

    /// Strategy id -> vote weight. Renormalised to sum to 1.
    pub strategy_weights: BTreeMap<String, f64>,

    pub consensus: ConsensusConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub supervisor: SupervisorConfig,
    pub breaker: BreakerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            timeframe: Timeframe::Hour1,
            bars_lookback: 200,
            analysis_interval_minutes: 15,
            monitor_interval_seconds: 10,
            strategy_timeout_ms: 2_000,
            price_timeout_ms: 2_000,
            max_daily_trades: 10,
            trading_timezone: "UTC".to_string(),
            initial_cash: 100_000.0,
            price_cache_ttl_seconds: 5,
            liquidate_on_shutdown: false,
            liquidate_on_emergency: false,
            metrics_log_interval_cycles: 10,
            database_url: None,
            strategy_weights: default_strategy_weights(),
            consensus: ConsensusConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            supervisor: SupervisorConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

/// `id:weight,id:weight`
fn parse_weights(raw: &str) -> Result<BTreeMap<String, f64>> {
    let mut weights = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (id, weight) = pair
            .split_once(':')
            .with_context(|| format!("strategy weight {:?} is not id:weight", pair))?;
        let weight: f64 = weight
            .trim()
            .parse()
            .with_context(|| format!("strategy weight for {} is not a number", id.trim()))?;
        weights.insert(id.trim().to_string(), weight);
    }
    Ok(weights)
}

fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let timeframe = match env::var("TIMEFRAME") {
            Ok(raw) => Timeframe::parse(&raw)
                .with_context(|| format!("TIMEFRAME has an invalid value: {:?}", raw))?,
            Err(_) => defaults.timeframe,
        };

        let strategy_weights = match env::var("STRATEGY_WEIGHTS") {
            Ok(raw) => parse_weights(&raw)?,
            Err(_) => defaults.strategy_weights.clone(),
        };

        let consensus = ConsensusConfig {
            min_consensus: env_or("MIN_CONSENSUS", defaults.consensus.min_consensus)?,
            min_confidence: env_or("MIN_CONFIDENCE", defaults.consensus.min_confidence)?,
            min_coherence: env_or("MIN_COHERENCE", defaults.consensus.min_coherence)?,
            max_contradiction: env_or("MAX_CONTRADICTION", defaults.consensus.max_contradiction)?,
            ..defaults.consensus.clone()
        };

        let risk = RiskConfig {
            risk_per_trade_percent: env_or(
                "RISK_PER_TRADE_PERCENT",
                defaults.risk.risk_per_trade_percent,
            )?,
            max_position_fraction: env_or(
                "MAX_POSITION_FRACTION",
                defaults.risk.max_position_fraction,
            )?,
            max_drawdown_percent: env_or("MAX_DRAWDOWN_PERCENT", defaults.risk.max_drawdown_percent)?,
            ..defaults.risk.clone()
        };

        let execution = ExecutionConfig {
            fee_rate: env_or("FEE_RATE", defaults.execution.fee_rate)?,
            slippage_bps: env_or("SLIPPAGE_BPS", defaults.execution.slippage_bps)?,
            ..defaults.execution.clone()
        };

        let supervisor = SupervisorConfig {
            trailing_activation_percent: env_or(
                "TRAILING_ACTIVATION_PERCENT",
                defaults.supervisor.trailing_activation_percent,
            )?,
            ..defaults.supervisor.clone()
        };

        let breaker = BreakerConfig {
            threshold: env_or("BREAKER_THRESHOLD", defaults.breaker.threshold)?,
            cooldown_minutes: env_or("BREAKER_COOLDOWN_MINUTES", defaults.breaker.cooldown_minutes)?,
        };

        let mut config = Self {
            symbols: env::var("SYMBOLS")
                .map(|raw| parse_symbols(&raw))
                .unwrap_or_else(|_| defaults.symbols.clone()),
            timeframe,
            bars_lookback: env_or("BARS_LOOKBACK", defaults.bars_lookback)?,
            analysis_interval_minutes: env_or(
                "ANALYSIS_INTERVAL_MINUTES",
                defaults.analysis_interval_minutes,
            )?,
            monitor_interval_seconds: env_or(
                "MONITOR_INTERVAL_SECONDS",
                defaults.monitor_interval_seconds,
            )?,
            strategy_timeout_ms: env_or("STRATEGY_TIMEOUT_MS", defaults.strategy_timeout_ms)?,
            price_timeout_ms: env_or("PRICE_TIMEOUT_MS", defaults.price_timeout_ms)?,
            max_daily_trades: env_or("MAX_DAILY_TRADES", defaults.max_daily_trades)?,
            trading_timezone: env::var("TRADING_TIMEZONE")
                .unwrap_or_else(|_| defaults.trading_timezone.clone()),
            initial_cash: env_or("INITIAL_CASH", defaults.initial_cash)?,
            price_cache_ttl_seconds: env_or(
                "PRICE_CACHE_TTL_SECONDS",
                defaults.price_cache_ttl_seconds,
            )?,
            liquidate_on_shutdown: env_or("LIQUIDATE_ON_SHUTDOWN", defaults.liquidate_on_shutdown)?,
            liquidate_on_emergency: env_or(
                "LIQUIDATE_ON_EMERGENCY",
                defaults.liquidate_on_emergency,
            )?,
            metrics_log_interval_cycles: env_or(
                "METRICS_LOG_INTERVAL_CYCLES",
                defaults.metrics_log_interval_cycles,
            )?,
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty()),
            strategy_weights,
            consensus,
            risk,
            execution,
            supervisor,
            breaker,
        };

        config.validate()?;
        Ok(config)
    }

    /// Range-check everything and renormalise strategy weights in place.
    pub fn validate(&mut self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("at least one symbol must be configured");
        }
        if self.analysis_interval_minutes == 0 {
            bail!("ANALYSIS_INTERVAL_MINUTES must be at least 1");
        }
        if self.monitor_interval_seconds == 0 {
            bail!("MONITOR_INTERVAL_SECONDS must be at least 1");
        }
        if self.strategy_timeout_ms == 0 {
            bail!("STRATEGY_TIMEOUT_MS must be positive");
        }
        if self.price_timeout_ms == 0 {
            bail!("PRICE_TIMEOUT_MS must be positive");
        }
        if self.bars_lookback < 2 {
            bail!("BARS_LOOKBACK must be at least 2");
        }
        if !self.initial_cash.is_finite() || self.initial_cash <= 0.0 {
            bail!("INITIAL_CASH must be positive (got {})", self.initial_cash);
        }
        self.timezone()?;

        self.consensus.validate().context("invalid consensus configuration")?;
        self.risk.validate().context("invalid risk configuration")?;

        let ex = &self.execution;
        if !(0.0..0.1).contains(&ex.fee_rate) {
            bail!("FEE_RATE must be in [0, 0.1) (got {})", ex.fee_rate);
        }
        if !(0.0..1_000.0).contains(&ex.slippage_bps) {
            bail!("SLIPPAGE_BPS must be in [0, 1000) (got {})", ex.slippage_bps);
        }
        if ex.max_quote_age_secs <= 0 {
            bail!("max quote age must be positive");
        }

        let sv = &self.supervisor;
        if sv.trailing_activation_percent < 0.0 || !sv.trailing_activation_percent.is_finite() {
            bail!("TRAILING_ACTIVATION_PERCENT must be non-negative");
        }
        if !(sv.default_trail_percent > 0.0 && sv.default_trail_percent < 100.0) {
            bail!("default trail percent must be in (0, 100)");
        }
        if !(sv.take_profit_extension_trigger > 0.0 && sv.take_profit_extension_trigger <= 1.0) {
            bail!("take-profit extension trigger must be in (0, 1]");
        }
        if sv.take_profit_extension_multiple < 0.0 {
            bail!("take-profit extension multiple must be non-negative");
        }

        if self.breaker.threshold == 0 {
            bail!("BREAKER_THRESHOLD must be at least 1");
        }
        if self.breaker.cooldown_minutes < 0 {
            bail!("BREAKER_COOLDOWN_MINUTES cannot be negative");
        }

        self.normalize_weights()
    }

    fn normalize_weights(&mut self) -> Result<()> {
        if self.strategy_weights.is_empty() {
            bail!("no strategy weights configured");
        }
        if self
            .strategy_weights
            .values()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            bail!("strategy weights must be finite and non-negative");
        }
        let sum: f64 = self.strategy_weights.values().sum();
        if sum <= 0.0 {
            bail!("strategy weights sum to zero");
        }
        if (sum - 1.0).abs() > 1e-9 {
            tracing::warn!("Strategy weights sum to {:.4}, renormalising to 1.0", sum);
            for w in self.strategy_weights.values_mut() {
                *w /= sum;
            }
        }
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.trading_timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("TRADING_TIMEZONE {:?}: {}", self.trading_timezone, e))
    }

    pub fn analysis_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.analysis_interval_minutes * 60)
    }

    pub fn monitor_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.monitor_interval_seconds)
    }

    pub fn strategy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.strategy_timeout_ms)
    }

    pub fn price_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.price_timeout_ms)
    }

    /// Apply a runtime update. Validated on a copy; `self` is untouched on error.
    pub fn apply(&mut self, update: &ConfigUpdate) -> Result<()> {
        let mut next = self.clone();
        if let Some(minutes) = update.analysis_interval_minutes {
            next.analysis_interval_minutes = minutes;
        }
        if let Some(cap) = update.max_daily_trades {
            next.max_daily_trades = cap;
        }
        if let Some(confidence) = update.min_confidence {
            next.consensus.min_confidence = confidence;
            next.risk.min_confidence = confidence;
        }
        if let Some(symbols) = &update.symbols {
            next.symbols = symbols
                .iter()
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Runtime-mutable subset of the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub analysis_interval_minutes: Option<u64>,
    pub max_daily_trades: Option<u32>,
    pub min_confidence: Option<f64>,
    pub symbols: Option<Vec<String>>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.analysis_interval_minutes.is_none()
            && self.max_daily_trades.is_none()
            && self.min_confidence.is_none()
            && self.symbols.is_none()
    }
}
