use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use analysis_core::{ConsensusDecision, MarketDataProvider, TradeSide};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use consensus_engine::{ConsensusEngine, ConsensusResult, ConsensusStats};
use portfolio_manager::{
    ExecutionSimulator, ExitReason, OpenOrder, Position, PositionLedger, SharedLedger,
};
use risk_manager::{CircuitBreaker, CircuitBreakerState, RiskAssessor, TradeProposal};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{AgentConfig, ConfigUpdate};
use crate::metrics::AgentMetrics;
use crate::position_manager::{ExitEvent, PositionSupervisor, SupervisorTick};
use crate::price_cache::PriceCache;
use crate::state_manager::StateStore;
use crate::strategy_manager::StrategyManager;

/// What the analysis cycle did for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CycleAction {
    Opened {
        position_id: Uuid,
        side: TradeSide,
        quantity: f64,
        entry_price: f64,
    },
    Hold,
    Skipped { reason: String },
    Rejected { reasons: Vec<String> },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolOutcome {
    pub symbol: String,
    pub decision: Option<ConsensusDecision>,
    pub action: CycleAction,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<SymbolOutcome>,
    pub duration_ms: u64,
}

impl CycleReport {
    pub fn opened(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.action, CycleAction::Opened { .. }))
            .count()
    }

    pub fn outcome(&self, symbol: &str) -> Option<&SymbolOutcome> {
        self.outcomes.iter().find(|o| o.symbol == symbol)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub emergency_stop: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: i64,
    pub symbols: Vec<String>,
    pub open_positions: Vec<Position>,
    pub cash_balance: Decimal,
    pub equity: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub drawdown_percent: f64,
    pub trades_today: u32,
    pub max_daily_trades: u32,
    pub breaker_tripped: bool,
    pub breaker: CircuitBreakerState,
    pub consensus_stats: ConsensusStats,
    pub cycles_run: u64,
    pub monitor_ticks: u64,
    pub last_cycle_ms: u64,
    pub last_tick_ms: u64,
}

/// Why entries are halted regardless of symbol.
enum Halt {
    Emergency,
    Breaker { remaining_secs: i64 },
}

impl Halt {
    fn reason(&self) -> String {
        match self {
            Halt::Emergency => "emergency stop active".to_string(),
            Halt::Breaker { remaining_secs } => {
                format!("circuit breaker tripped ({}s remaining)", remaining_secs)
            }
        }
    }
}

struct DailyCounter {
    day: NaiveDate,
    trades: u32,
}

struct EngineCore {
    config: RwLock<AgentConfig>,
    timezone: Tz,
    provider: Arc<dyn MarketDataProvider>,
    prices: Arc<PriceCache>,
    strategies: StrategyManager,
    consensus: RwLock<ConsensusEngine>,
    consensus_stats: Mutex<ConsensusStats>,
    risk: RwLock<RiskAssessor>,
    simulator: ExecutionSimulator,
    supervisor: PositionSupervisor,
    ledger: SharedLedger,
    breaker: Mutex<CircuitBreaker>,
    store: Option<Arc<dyn StateStore>>,
    metrics: Mutex<AgentMetrics>,
    daily: Mutex<DailyCounter>,
    running: AtomicBool,
    emergency: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    // Serializes analysis cycles between the loop and force_analysis.
    analysis_lock: Mutex<()>,
    schedule_changed: Notify,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Drives the periodic analysis cycle and the faster monitor cycle over one
/// shared ledger, and exposes the operator control surface.
#[derive(Clone)]
pub struct TradingEngine {
    core: Arc<EngineCore>,
}

impl TradingEngine {
    /// Build the engine. With a store, the ledger, breaker and metrics are
    /// restored from the last persisted state.
    pub async fn new(
        mut config: AgentConfig,
        provider: Arc<dyn MarketDataProvider>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let timezone = config.timezone()?;

        let prices = Arc::new(PriceCache::new(
            Arc::clone(&provider),
            std::time::Duration::from_secs(config.price_cache_ttl_seconds),
            config.price_timeout(),
        ));
        let strategies =
            StrategyManager::with_default_units(config.strategy_weights.clone(), config.strategy_timeout());
        Self::assemble(config, timezone, provider, prices, strategies, store).await
    }

    /// Like [`TradingEngine::new`] but with caller-supplied strategy units.
    pub async fn with_strategies(
        mut config: AgentConfig,
        provider: Arc<dyn MarketDataProvider>,
        strategies: StrategyManager,
        store: Option<Arc<dyn StateStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let timezone = config.timezone()?;
        let prices = Arc::new(PriceCache::new(
            Arc::clone(&provider),
            std::time::Duration::from_secs(config.price_cache_ttl_seconds),
            config.price_timeout(),
        ));
        Self::assemble(config, timezone, provider, prices, strategies, store).await
    }

    async fn assemble(
        config: AgentConfig,
        timezone: Tz,
        provider: Arc<dyn MarketDataProvider>,
        prices: Arc<PriceCache>,
        strategies: StrategyManager,
        store: Option<Arc<dyn StateStore>>,
    ) -> Result<Self> {
        let risk = RiskAssessor::new(config.risk.clone()).context("risk configuration")?;
        let simulator = ExecutionSimulator::new(config.execution.clone());
        let supervisor = PositionSupervisor::new(
            config.supervisor.clone(),
            simulator.clone(),
            Arc::clone(&prices),
        );

        let mut ledger = PositionLedger::new(
            Decimal::try_from(config.initial_cash).context("INITIAL_CASH is not representable")?,
        );
        let mut breaker = CircuitBreaker::new(config.breaker.threshold, config.breaker.cooldown())
            .context("breaker configuration")?;
        let mut metrics = AgentMetrics::new(config.metrics_log_interval_cycles);

        if let Some(store) = &store {
            if let Some(state) = store.load_portfolio().await.context("loading portfolio")? {
                ledger = PositionLedger::from_state(state).context("restoring ledger")?;
                let stored_open = store.load_open_positions().await.unwrap_or_default();
                if stored_open.len() != ledger.open_count() {
                    tracing::warn!(
                        "Portfolio snapshot has {} open position(s) but the positions table has {}",
                        ledger.open_count(),
                        stored_open.len()
                    );
                }
                tracing::info!(
                    "Restored ledger: cash {} with {} open position(s)",
                    ledger.cash_balance(),
                    ledger.open_count()
                );
            }
            if let Some(state) = store.load_breaker().await.context("loading breaker")? {
                breaker = CircuitBreaker::from_state(state).context("restoring breaker")?;
                breaker
                    .reconfigure(config.breaker.threshold, config.breaker.cooldown())
                    .context("breaker configuration")?;
            }
            match store.load_metrics().await {
                Ok(Some(saved)) => metrics.restore_from_json(&saved),
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to load metrics: {}", e),
            }
        }

        let today = Utc::now().with_timezone(&timezone).date_naive();
        let (shutdown, _) = watch::channel(false);

        let core = EngineCore {
            consensus: RwLock::new(ConsensusEngine::new(config.consensus.clone())),
            consensus_stats: Mutex::new(ConsensusStats::default()),
            risk: RwLock::new(risk),
            simulator,
            supervisor,
            ledger: SharedLedger::new(ledger),
            breaker: Mutex::new(breaker),
            store,
            metrics: Mutex::new(metrics),
            daily: Mutex::new(DailyCounter {
                day: today,
                trades: 0,
            }),
            running: AtomicBool::new(false),
            emergency: AtomicBool::new(false),
            started_at: Mutex::new(None),
            analysis_lock: Mutex::new(()),
            schedule_changed: Notify::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            timezone,
            provider,
            prices,
            strategies,
            config: RwLock::new(config),
        };

        Ok(Self {
            core: Arc::new(core),
        })
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.core.ledger
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Spawn the analysis and monitor loops.
    pub async fn start(&self) -> Result<()> {
        if self.core.running.swap(true, Ordering::SeqCst) {
            bail!("engine is already running");
        }
        self.core.shutdown.send_replace(false);
        *self.core.started_at.lock().await = Some(Utc::now());

        let config = self.core.config.read().await;
        tracing::info!(
            "Engine started: {} symbol(s), analysis every {}m, monitor every {}s",
            config.symbols.len(),
            config.analysis_interval_minutes,
            config.monitor_interval_seconds
        );
        drop(config);

        let analysis = tokio::spawn(analysis_loop(
            Arc::clone(&self.core),
            self.core.shutdown.subscribe(),
        ));
        let monitor = tokio::spawn(monitor_loop(
            Arc::clone(&self.core),
            self.core.shutdown.subscribe(),
        ));
        self.core.tasks.lock().await.extend([analysis, monitor]);
        Ok(())
    }

    /// Halt scheduling. The in-flight tick of each loop finishes first; then
    /// positions are optionally liquidated and all state is persisted.
    pub async fn stop(&self) -> Result<()> {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            tracing::debug!("stop() called on an engine that is not running");
            return Ok(());
        }
        self.core.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.core.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Engine task ended abnormally: {}", e);
            }
        }

        if self.core.config.read().await.liquidate_on_shutdown {
            self.core.liquidate(ExitReason::Liquidation).await;
        }
        self.core.persist(&[]).await;
        self.core.save_metrics().await;
        self.core.metrics.lock().await.log_metrics();
        *self.core.started_at.lock().await = None;
        tracing::info!("Engine stopped");
        Ok(())
    }

    /// Run one analysis cycle now and wait for it.
    pub async fn force_analysis(&self) -> CycleReport {
        self.core.run_analysis_cycle().await
    }

    /// Run one monitor tick now and wait for it.
    pub async fn force_monitor(&self) -> SupervisorTick {
        self.core.run_monitor_tick().await
    }

    pub async fn get_status(&self) -> EngineStatus {
        let core = &self.core;
        let now = Utc::now();
        let snapshot = core.ledger.snapshot();
        let started_at = *core.started_at.lock().await;
        let (symbols, max_daily_trades) = {
            let config = core.config.read().await;
            (config.symbols.clone(), config.max_daily_trades)
        };
        let (breaker_tripped, breaker) = {
            let mut breaker = core.breaker.lock().await;
            (breaker.is_tripped_at(now), breaker.state().clone())
        };
        let metrics = core.metrics.lock().await;

        EngineStatus {
            running: core.running.load(Ordering::SeqCst),
            emergency_stop: core.emergency.load(Ordering::SeqCst),
            started_at,
            uptime_seconds: started_at.map(|t| (now - t).num_seconds()).unwrap_or(0),
            symbols,
            open_positions: snapshot.open_positions,
            cash_balance: snapshot.cash_balance,
            equity: snapshot.equity,
            realized_pnl: snapshot.realized_pnl,
            unrealized_pnl: snapshot.unrealized_pnl,
            drawdown_percent: snapshot.current_drawdown,
            trades_today: core.daily.lock().await.trades,
            max_daily_trades,
            breaker_tripped,
            breaker,
            consensus_stats: core.consensus_stats.lock().await.clone(),
            cycles_run: metrics.cycles_run,
            monitor_ticks: metrics.monitor_ticks,
            last_cycle_ms: metrics.last_total_duration_ms,
            last_tick_ms: metrics.last_tick_duration_ms,
        }
    }

    /// Apply a validated partial update. Nothing changes on error.
    pub async fn update_configuration(&self, update: ConfigUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let core = &self.core;
        let mut config = core.config.write().await;
        let mut next = config.clone();
        next.apply(&update)?;

        if let Some(confidence) = update.min_confidence {
            let mut risk = core.risk.write().await;
            risk.set_min_confidence(confidence)
                .context("rejected confidence threshold")?;
            core.consensus
                .write()
                .await
                .set_config(next.consensus.clone());
        }

        let interval_changed = next.analysis_interval_minutes != config.analysis_interval_minutes;
        *config = next;
        drop(config);

        tracing::info!("Configuration updated: {:?}", update);
        if interval_changed {
            core.schedule_changed.notify_waiters();
        }
        Ok(())
    }

    /// Block new entries immediately. Open positions stay supervised unless
    /// liquidation on emergency is configured.
    ///
    /// Entries re-check the flag under the breaker lock, so once this returns
    /// no in-flight analysis cycle can open a position.
    pub async fn emergency_stop(&self) -> Vec<ExitEvent> {
        self.core.emergency.store(true, Ordering::SeqCst);
        // Wait out an entry that is already inside its open section.
        drop(self.core.breaker.lock().await);
        tracing::warn!("EMERGENCY STOP: new entries blocked");
        if self.core.config.read().await.liquidate_on_emergency {
            self.core.liquidate(ExitReason::EmergencyStop).await
        } else {
            Vec::new()
        }
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.core.emergency.load(Ordering::SeqCst)
    }

    /// Operator override for a tripped breaker.
    pub async fn reset_circuit_breaker(&self) {
        self.core.breaker.lock().await.reset();
        tracing::info!("Circuit breaker reset by operator");
        self.core.persist(&[]).await;
    }
}

fn record_in_breaker(breaker: &mut CircuitBreaker, exits: &[ExitEvent], now: DateTime<Utc>) {
    for exit in exits {
        if breaker.record_at(exit.profitable, now) {
            tracing::warn!(
                "Circuit breaker tripped after {} consecutive losses",
                breaker.state().consecutive_losses
            );
        }
    }
}

async fn analysis_loop(core: Arc<EngineCore>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        core.run_analysis_cycle().await;

        let interval = core.config.read().await.analysis_interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = core.schedule_changed.notified() => {
                tracing::debug!("Analysis schedule changed");
            }
            _ = shutdown.changed() => {}
        }
    }
    tracing::debug!("Analysis loop exited");
}

async fn monitor_loop(core: Arc<EngineCore>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        core.run_monitor_tick().await;

        let interval = core.config.read().await.monitor_interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }
    tracing::debug!("Monitor loop exited");
}

impl EngineCore {
    async fn run_analysis_cycle(&self) -> CycleReport {
        let _cycle = self.analysis_lock.lock().await;
        let cycle_start = AgentMetrics::start_timer();
        let started_at = Utc::now();
        self.roll_day(started_at).await;

        let config = self.config.read().await.clone();
        tracing::info!("Starting analysis cycle over {} symbol(s)", config.symbols.len());

        let mut report = CycleReport {
            started_at: Some(started_at),
            ..CycleReport::default()
        };
        let mut seen = HashSet::new();
        for symbol in &config.symbols {
            if !seen.insert(symbol.as_str()) {
                continue;
            }
            let outcome = match self.analyze_symbol(symbol, &config).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Analysis of {} failed: {:#}", symbol, e);
                    self.metrics.lock().await.analysis_errors += 1;
                    SymbolOutcome {
                        symbol: symbol.clone(),
                        decision: None,
                        action: CycleAction::Failed {
                            error: format!("{:#}", e),
                        },
                    }
                }
            };
            report.outcomes.push(outcome);
        }

        report.duration_ms = cycle_start.elapsed().as_millis() as u64;
        self.metrics.lock().await.finish_cycle(cycle_start);
        self.save_metrics().await;
        tracing::info!(
            "Analysis cycle complete in {}ms: {} opened",
            report.duration_ms,
            report.opened()
        );
        report
    }

    async fn analyze_symbol(&self, symbol: &str, config: &AgentConfig) -> Result<SymbolOutcome> {
        let fetch_start = AgentMetrics::start_timer();
        let bars = tokio::time::timeout(
            config.strategy_timeout(),
            self.provider
                .get_ohlcv(symbol, config.timeframe, config.bars_lookback),
        )
        .await
        .with_context(|| format!("bar fetch for {} timed out", symbol))?
        .with_context(|| format!("bar fetch for {}", symbol))?;

        let analysis_start = AgentMetrics::start_timer();
        let gathered = self.strategies.gather(symbol, &bars).await;
        let result = self.consensus.read().await.combine(symbol, &gathered.opinions);
        self.consensus_stats.lock().await.record(&result);
        {
            let mut metrics = self.metrics.lock().await;
            metrics.record_fetch_duration(fetch_start);
            metrics.record_analysis_duration(analysis_start);
            metrics.symbols_analyzed += 1;
            metrics.opinions_collected += gathered.opinions.len() as u64;
            metrics.strategies_excluded += gathered.excluded() as u64;
            if result.is_actionable() {
                metrics.consensus_directional += 1;
            }
        }
        tracing::info!(
            symbol = %symbol,
            decision = %result.decision.to_label(),
            consensus = result.consensus_percentage,
            confidence = result.weighted_confidence,
            coherence = result.coherence_score,
            opinions = gathered.opinions.len(),
            excluded = gathered.excluded(),
            "Consensus"
        );

        let decision = Some(result.decision);
        let outcome = |action| SymbolOutcome {
            symbol: symbol.to_string(),
            decision,
            action,
        };

        if !result.is_actionable() {
            return Ok(outcome(CycleAction::Hold));
        }
        if let Some(reason) = self.entry_block(symbol, config).await {
            tracing::info!("Skipping {} entry: {}", symbol, reason);
            return Ok(outcome(CycleAction::Skipped { reason }));
        }

        let quote = match self
            .prices
            .get(symbol)
            .await
            .with_context(|| format!("price for {}", symbol))?
        {
            Some(quote) => quote,
            None => {
                return Ok(outcome(CycleAction::Skipped {
                    reason: "no current price".to_string(),
                }))
            }
        };

        let proposal = match TradeProposal::from_consensus(&result, quote.price, bars) {
            Some(proposal) => proposal,
            None => return Ok(outcome(CycleAction::Hold)),
        };
        let assessment = self
            .risk
            .read()
            .await
            .assess(&proposal, &self.ledger.snapshot());

        if !assessment.approved {
            self.metrics.lock().await.risk_rejected += 1;
            tracing::info!(
                "Risk rejected {} {}: {}",
                assessment.side,
                symbol,
                assessment.rejection_reasons.join("; ")
            );
            return Ok(outcome(CycleAction::Rejected {
                reasons: assessment.rejection_reasons,
            }));
        }
        self.metrics.lock().await.risk_approved += 1;

        let order = OpenOrder {
            symbol: symbol.to_string(),
            side: assessment.side,
            quantity: assessment.recommended_size,
            quote,
            stop_loss: assessment.stop_loss_price,
            take_profit: assessment.take_profit_price,
            trailing_distance: assessment.trailing_distance,
        };
        Ok(outcome(self.execute_entry(order, &result).await))
    }

    /// Reason a new entry on `symbol` is not allowed right now, if any.
    async fn entry_block(&self, symbol: &str, config: &AgentConfig) -> Option<String> {
        if self.emergency.load(Ordering::SeqCst) {
            return Some(Halt::Emergency.reason());
        }
        if self.ledger.read(|l| l.has_open(symbol)).await {
            return Some("position already open".to_string());
        }
        let halt = {
            let mut breaker = self.breaker.lock().await;
            self.halt(&mut breaker, Utc::now())
        };
        if let Some(halt) = halt {
            self.count_halt(&halt).await;
            return Some(halt.reason());
        }
        let trades_today = self.daily.lock().await.trades;
        if trades_today >= config.max_daily_trades {
            return Some(format!(
                "daily trade cap reached ({}/{})",
                trades_today, config.max_daily_trades
            ));
        }
        None
    }

    /// Emergency stop or breaker gate. Callers hold the breaker lock.
    fn halt(&self, breaker: &mut CircuitBreaker, now: DateTime<Utc>) -> Option<Halt> {
        if self.emergency.load(Ordering::SeqCst) {
            return Some(Halt::Emergency);
        }
        if breaker.is_tripped_at(now) {
            let remaining_secs = breaker
                .remaining_cooldown_at(now)
                .map(|d| d.num_seconds())
                .unwrap_or(0);
            return Some(Halt::Breaker { remaining_secs });
        }
        None
    }

    async fn count_halt(&self, halt: &Halt) {
        if matches!(halt, Halt::Breaker { .. }) {
            self.metrics.lock().await.breaker_blocks += 1;
        }
    }

    async fn execute_entry(&self, order: OpenOrder, result: &ConsensusResult) -> CycleAction {
        let exec_start = AgentMetrics::start_timer();
        let symbol = order.symbol.clone();

        // Lock order: breaker, then ledger. The gate is re-checked here since
        // the price fetch and risk assessment ran without either lock.
        let mut breaker = self.breaker.lock().await;
        let now = Utc::now();
        if let Some(halt) = self.halt(&mut breaker, now) {
            drop(breaker);
            self.count_halt(&halt).await;
            tracing::info!("Entry on {} halted: {}", symbol, halt.reason());
            return CycleAction::Skipped {
                reason: halt.reason(),
            };
        }
        let opened = self
            .ledger
            .with_ledger(|ledger| self.simulator.open(ledger, order, now))
            .await;
        drop(breaker);
        self.metrics.lock().await.record_execution_duration(exec_start);

        match opened {
            Ok(position) => {
                self.daily.lock().await.trades += 1;
                self.metrics.lock().await.trades_executed += 1;
                tracing::info!(
                    symbol = %position.symbol,
                    side = %position.side,
                    quantity = position.quantity,
                    entry = position.entry_price,
                    stop = position.stop_loss,
                    target = position.take_profit,
                    consensus = result.consensus_percentage,
                    "Entry executed"
                );
                self.persist(std::slice::from_ref(&position)).await;
                CycleAction::Opened {
                    position_id: position.id,
                    side: position.side,
                    quantity: position.quantity,
                    entry_price: position.entry_price,
                }
            }
            Err(e) => {
                self.metrics.lock().await.trades_failed += 1;
                tracing::warn!("Entry on {} failed: {}", symbol, e);
                CycleAction::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn run_monitor_tick(&self) -> SupervisorTick {
        let start = AgentMetrics::start_timer();
        let quotes = self.supervisor.fetch_quotes(&self.ledger).await;
        let tick = if quotes.is_empty() {
            SupervisorTick::default()
        } else {
            let now = Utc::now();
            // Exits reach the breaker before the ledger lock is released.
            let mut breaker = self.breaker.lock().await;
            let mut tick = self
                .ledger
                .with_ledger(|ledger| {
                    let tick = self.supervisor.apply(ledger, &quotes.priced, now);
                    record_in_breaker(&mut breaker, &tick.exits, now);
                    tick
                })
                .await;
            drop(breaker);
            tick.unpriced.extend(quotes.unpriced);
            tick
        };
        for error in &tick.errors {
            tracing::warn!("Monitor: {}", error);
        }
        if !tick.exits.is_empty() {
            self.record_exit_metrics(&tick.exits).await;
            let closed: Vec<Position> = tick.exits.iter().map(|e| e.position.clone()).collect();
            self.persist(&closed).await;
        } else if tick.repriced > 0 {
            self.persist(&[]).await;
        }
        self.metrics.lock().await.record_tick(start);
        tick
    }

    async fn record_exit_metrics(&self, exits: &[ExitEvent]) {
        let mut metrics = self.metrics.lock().await;
        for exit in exits {
            metrics.record_trade_result(exit.pnl());
        }
    }

    async fn liquidate(&self, reason: ExitReason) -> Vec<ExitEvent> {
        let now = Utc::now();
        let mut breaker = self.breaker.lock().await;
        let exits = self
            .ledger
            .with_ledger(|ledger| {
                let exits = self.supervisor.liquidate(ledger, reason, now);
                record_in_breaker(&mut breaker, &exits, now);
                exits
            })
            .await;
        drop(breaker);
        if !exits.is_empty() {
            self.record_exit_metrics(&exits).await;
            let closed: Vec<Position> = exits.iter().map(|e| e.position.clone()).collect();
            self.persist(&closed).await;
        }
        exits
    }

    async fn roll_day(&self, now: DateTime<Utc>) {
        let today = now.with_timezone(&self.timezone).date_naive();
        let mut daily = self.daily.lock().await;
        if today != daily.day {
            tracing::info!(
                "New trading day {} ({} trade(s) on {})",
                today,
                daily.trades,
                daily.day
            );
            daily.day = today;
            daily.trades = 0;
        }
    }

    /// Write through to the store. Failures are logged and never abort the
    /// caller. Trade records stay on the ledger until the store has accepted
    /// them; without a store they are never drained.
    async fn persist(&self, touched: &[Position]) {
        let Some(store) = &self.store else {
            return;
        };

        for position in touched {
            if let Err(e) = store.save_position(position).await {
                tracing::warn!("Failed to persist position {}: {}", position.id, e);
            }
        }

        // Stop at the first failed append so the stored history stays in order.
        let mut pending = self.ledger.with_ledger(|l| l.take_history()).await.into_iter();
        while let Some(trade) = pending.next() {
            if let Err(e) = store.append_trade(&trade).await {
                tracing::warn!("Failed to append trade {}: {}", trade.id, e);
                let unwritten: Vec<_> = std::iter::once(trade).chain(pending).collect();
                tracing::warn!("{} trade record(s) kept for the next write", unwritten.len());
                self.ledger
                    .with_ledger(|l| l.requeue_history(unwritten))
                    .await;
                break;
            }
        }
        if let Err(e) = store.save_portfolio(&self.ledger.snapshot()).await {
            tracing::warn!("Failed to persist portfolio: {}", e);
        }
        let breaker = self.breaker.lock().await.state().clone();
        if let Err(e) = store.save_breaker(&breaker).await {
            tracing::warn!("Failed to persist circuit breaker: {}", e);
        }
    }

    async fn save_metrics(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let json = self.metrics.lock().await.to_json();
        if let Err(e) = store.save_metrics(&json).await {
            tracing::debug!("Failed to persist metrics: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_manager::SqlStateStore;
    use analysis_core::{
        AnalysisError, Bar, Direction, PriceQuote, StrategyOpinion, StrategyUnit, Timeframe,
    };
    use async_trait::async_trait;
    use portfolio_manager::{PortfolioState, TradeAction, TradeRecord};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct ScriptedFeed {
        price: StdMutex<f64>,
    }

    impl ScriptedFeed {
        fn new(price: f64) -> Arc<Self> {
            Arc::new(Self {
                price: StdMutex::new(price),
            })
        }

        fn set(&self, price: f64) {
            *self.price.lock().unwrap() = price;
        }
    }

    #[async_trait]
    impl MarketDataProvider for ScriptedFeed {
        async fn get_ohlcv(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Bar>, AnalysisError> {
            let price = *self.price.lock().unwrap();
            let start = Utc::now() - chrono::Duration::hours(limit as i64);
            Ok((0..limit)
                .map(|i| Bar {
                    timestamp: start + chrono::Duration::hours(i as i64),
                    open: price,
                    high: price + 1.0,
                    low: price - 1.0,
                    close: price,
                    volume: 1_000.0,
                    vwap: None,
                })
                .collect())
        }

        async fn get_price(&self, _symbol: &str) -> Result<Option<PriceQuote>, AnalysisError> {
            Ok(Some(PriceQuote::new(*self.price.lock().unwrap(), Utc::now())))
        }
    }

    fn flat_bars(price: f64, limit: usize) -> Vec<Bar> {
        let start = Utc::now() - chrono::Duration::hours(limit as i64);
        (0..limit)
            .map(|i| Bar {
                timestamp: start + chrono::Duration::hours(i as i64),
                open: price,
                high: price + 1.0,
                low: price - 1.0,
                close: price,
                volume: 1_000.0,
                vwap: None,
            })
            .collect()
    }

    /// Per-symbol prices. `get_price` on the gated symbol signals `entered`
    /// and then waits for `release`.
    struct GatedFeed {
        prices: StdMutex<HashMap<String, f64>>,
        gated: &'static str,
        entered: Notify,
        release: Notify,
    }

    impl GatedFeed {
        fn new(gated: &'static str) -> Arc<Self> {
            Arc::new(Self {
                prices: StdMutex::new(HashMap::new()),
                gated,
                entered: Notify::new(),
                release: Notify::new(),
            })
        }

        fn set(&self, symbol: &str, price: f64) {
            self.prices.lock().unwrap().insert(symbol.to_string(), price);
        }

        fn price(&self, symbol: &str) -> f64 {
            self.prices.lock().unwrap().get(symbol).copied().unwrap_or(100.0)
        }
    }

    #[async_trait]
    impl MarketDataProvider for GatedFeed {
        async fn get_ohlcv(
            &self,
            symbol: &str,
            _timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Bar>, AnalysisError> {
            Ok(flat_bars(self.price(symbol), limit))
        }

        async fn get_price(&self, symbol: &str) -> Result<Option<PriceQuote>, AnalysisError> {
            if symbol == self.gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(Some(PriceQuote::new(self.price(symbol), Utc::now())))
        }
    }

    /// Serves bars but never answers a price request.
    struct StalledPrices;

    #[async_trait]
    impl MarketDataProvider for StalledPrices {
        async fn get_ohlcv(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Bar>, AnalysisError> {
            Ok(flat_bars(100.0, limit))
        }

        async fn get_price(&self, _symbol: &str) -> Result<Option<PriceQuote>, AnalysisError> {
            std::future::pending::<Result<Option<PriceQuote>, AnalysisError>>().await
        }
    }

    /// SQLite store whose trade appends can be switched off.
    struct FlakyStore {
        inner: SqlStateStore,
        fail_appends: AtomicBool,
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn save_position(&self, position: &Position) -> Result<()> {
            self.inner.save_position(position).await
        }
        async fn load_open_positions(&self) -> Result<Vec<Position>> {
            self.inner.load_open_positions().await
        }
        async fn save_portfolio(&self, state: &PortfolioState) -> Result<()> {
            self.inner.save_portfolio(state).await
        }
        async fn load_portfolio(&self) -> Result<Option<PortfolioState>> {
            self.inner.load_portfolio().await
        }
        async fn save_breaker(&self, state: &CircuitBreakerState) -> Result<()> {
            self.inner.save_breaker(state).await
        }
        async fn load_breaker(&self) -> Result<Option<CircuitBreakerState>> {
            self.inner.load_breaker().await
        }
        async fn append_trade(&self, trade: &TradeRecord) -> Result<()> {
            if self.fail_appends.load(Ordering::SeqCst) {
                bail!("trade_history is unavailable");
            }
            self.inner.append_trade(trade).await
        }
        async fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>> {
            self.inner.trade_history(limit).await
        }
        async fn save_metrics(&self, metrics: &serde_json::Value) -> Result<()> {
            self.inner.save_metrics(metrics).await
        }
        async fn load_metrics(&self) -> Result<Option<serde_json::Value>> {
            self.inner.load_metrics().await
        }
    }

    struct Vote {
        id: &'static str,
        direction: Direction,
        confidence: f64,
    }

    #[async_trait]
    impl StrategyUnit for Vote {
        fn id(&self) -> &str {
            self.id
        }

        async fn evaluate(
            &self,
            symbol: &str,
            bars: &[Bar],
        ) -> Result<Option<StrategyOpinion>, AnalysisError> {
            let last = bars
                .last()
                .ok_or_else(|| AnalysisError::InsufficientData("no bars".into()))?;
            Ok(Some(StrategyOpinion::new(
                self.id,
                symbol,
                self.direction,
                self.confidence,
                last.close,
                last.timestamp,
            )))
        }
    }

    fn bullish_manager() -> StrategyManager {
        let weights: BTreeMap<String, f64> = [("a", 0.4), ("b", 0.35), ("c", 0.25)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let units: Vec<Arc<dyn StrategyUnit>> = vec![
            Arc::new(Vote { id: "a", direction: Direction::Buy, confidence: 80.0 }),
            Arc::new(Vote { id: "b", direction: Direction::Buy, confidence: 70.0 }),
            Arc::new(Vote { id: "c", direction: Direction::Hold, confidence: 50.0 }),
        ];
        StrategyManager::new(units, weights, Duration::from_secs(1))
    }

    fn test_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.symbols = vec!["BTCUSDT".to_string()];
        config.bars_lookback = 60;
        config.strategy_weights = [("a", 0.4), ("b", 0.35), ("c", 0.25)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        config.price_cache_ttl_seconds = 0;
        config
    }

    async fn engine(feed: Arc<ScriptedFeed>, config: AgentConfig) -> TradingEngine {
        TradingEngine::with_strategies(config, feed, bullish_manager(), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cycle_opens_once_per_symbol() {
        let feed = ScriptedFeed::new(100.0);
        let engine = engine(feed, test_config()).await;

        let report = engine.force_analysis().await;
        assert_eq!(report.opened(), 1);
        assert!(engine.ledger().snapshot().has_open("BTCUSDT"));

        let again = engine.force_analysis().await;
        assert_eq!(again.opened(), 0);
        assert_eq!(
            again.outcome("BTCUSDT").unwrap().action,
            CycleAction::Skipped {
                reason: "position already open".to_string()
            }
        );
        assert_eq!(engine.get_status().await.trades_today, 1);
    }

    #[tokio::test]
    async fn test_daily_cap_blocks_entries() {
        let feed = ScriptedFeed::new(100.0);
        let mut config = test_config();
        config.max_daily_trades = 0;
        let engine = engine(feed, config).await;

        let report = engine.force_analysis().await;
        assert!(matches!(
            report.outcome("BTCUSDT").unwrap().action,
            CycleAction::Skipped { .. }
        ));
        assert_eq!(engine.ledger().snapshot().open_positions.len(), 0);
    }

    #[tokio::test]
    async fn test_emergency_stop_blocks_entries_but_keeps_positions() {
        let feed = ScriptedFeed::new(100.0);
        let engine = engine(feed, test_config()).await;
        engine.force_analysis().await;

        let exits = engine.emergency_stop().await;
        assert!(exits.is_empty());
        assert!(engine.is_emergency_stopped());
        assert_eq!(engine.ledger().snapshot().open_positions.len(), 1);

        let mut update = ConfigUpdate::default();
        update.symbols = Some(vec!["BTCUSDT".into(), "ETHUSDT".into()]);
        engine.update_configuration(update).await.unwrap();
        let report = engine.force_analysis().await;
        assert_eq!(
            report.outcome("ETHUSDT").unwrap().action,
            CycleAction::Skipped {
                reason: "emergency stop active".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_emergency_liquidation_when_configured() {
        let feed = ScriptedFeed::new(100.0);
        let mut config = test_config();
        config.liquidate_on_emergency = true;
        let engine = engine(feed, config).await;
        engine.force_analysis().await;

        let exits = engine.emergency_stop().await;
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, ExitReason::EmergencyStop);
        assert!(engine.ledger().snapshot().open_positions.is_empty());
    }

    #[tokio::test]
    async fn test_monitor_closes_on_stop_and_feeds_breaker() {
        let feed = ScriptedFeed::new(100.0);
        let engine = engine(feed.clone(), test_config()).await;
        engine.force_analysis().await;
        let stop = engine.ledger().snapshot().open_positions[0].stop_loss;

        feed.set(stop - 1.0);
        let tick = engine.force_monitor().await;
        assert_eq!(tick.exits.len(), 1);
        assert_eq!(tick.exits[0].reason, ExitReason::StopLoss);

        let status = engine.get_status().await;
        assert!(status.open_positions.is_empty());
        assert_eq!(status.breaker.consecutive_losses, 1);
        assert!(!status.breaker_tripped);
    }

    #[tokio::test]
    async fn test_invalid_update_leaves_config_untouched() {
        let feed = ScriptedFeed::new(100.0);
        let engine = engine(feed, test_config()).await;

        let mut update = ConfigUpdate::default();
        update.min_confidence = Some(150.0);
        assert!(engine.update_configuration(update).await.is_err());

        let mut update = ConfigUpdate::default();
        update.symbols = Some(Vec::new());
        assert!(engine.update_configuration(update).await.is_err());
        assert_eq!(engine.get_status().await.symbols, vec!["BTCUSDT".to_string()]);
    }

    #[tokio::test]
    async fn test_raised_confidence_turns_entries_into_holds() {
        let feed = ScriptedFeed::new(100.0);
        let engine = engine(feed, test_config()).await;

        let mut update = ConfigUpdate::default();
        update.min_confidence = Some(90.0);
        engine.update_configuration(update).await.unwrap();

        let report = engine.force_analysis().await;
        assert_eq!(report.opened(), 0);
        assert!(engine.ledger().snapshot().open_positions.is_empty());
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let feed = ScriptedFeed::new(100.0);
        let engine = engine(feed, test_config()).await;

        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        assert!(engine.is_running());
        assert!(engine.get_status().await.started_at.is_some());

        // Give the analysis loop its first tick.
        for _ in 0..50 {
            if engine.get_status().await.cycles_run > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        engine.stop().await.unwrap();
        assert!(!engine.is_running());

        let status = engine.get_status().await;
        assert!(status.cycles_run >= 1);
        assert_eq!(status.uptime_seconds, 0);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let store: Arc<dyn StateStore> =
            Arc::new(SqlStateStore::connect("sqlite::memory:").await.unwrap());
        let feed = ScriptedFeed::new(100.0);

        let first = TradingEngine::with_strategies(
            test_config(),
            feed.clone(),
            bullish_manager(),
            Some(Arc::clone(&store)),
        )
        .await
        .unwrap();
        first.force_analysis().await;
        let opened = first.ledger().snapshot();
        assert_eq!(opened.open_positions.len(), 1);

        let second = TradingEngine::with_strategies(
            test_config(),
            feed,
            bullish_manager(),
            Some(Arc::clone(&store)),
        )
        .await
        .unwrap();
        let restored = second.ledger().snapshot();
        assert_eq!(restored.open_positions.len(), 1);
        assert_eq!(restored.open_positions[0].id, opened.open_positions[0].id);
        assert_eq!(store.trade_history(10).await.unwrap().len(), 1);
        assert_eq!(second.get_status().await.cycles_run, 1);
    }

    #[tokio::test]
    async fn test_stalled_price_fails_the_symbol_instead_of_hanging() {
        let mut config = test_config();
        config.price_timeout_ms = 50;
        let engine =
            TradingEngine::with_strategies(config, Arc::new(StalledPrices), bullish_manager(), None)
                .await
                .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), engine.force_analysis())
            .await
            .expect("analysis cycle hung on the price fetch");
        assert!(matches!(
            report.outcome("BTCUSDT").unwrap().action,
            CycleAction::Failed { .. }
        ));
        assert!(engine.ledger().snapshot().open_positions.is_empty());
    }

    #[tokio::test]
    async fn test_breaker_tripped_during_cycle_blocks_pending_entry() {
        let feed = GatedFeed::new("ETHUSDT");
        let mut config = test_config();
        config.breaker.threshold = 1;
        let engine = TradingEngine::with_strategies(config, feed.clone(), bullish_manager(), None)
            .await
            .unwrap();
        assert_eq!(engine.force_analysis().await.opened(), 1);
        let stop = engine.ledger().snapshot().open_positions[0].stop_loss;

        let mut update = ConfigUpdate::default();
        update.symbols = Some(vec!["ETHUSDT".into()]);
        engine.update_configuration(update).await.unwrap();

        // BTC stops out while the ETH entry waits on its price.
        let monitor = async {
            feed.entered.notified().await;
            feed.set("BTCUSDT", stop - 1.0);
            let tick = engine.force_monitor().await;
            feed.release.notify_one();
            tick
        };
        let (report, tick) = tokio::join!(engine.force_analysis(), monitor);

        assert_eq!(tick.exits.len(), 1);
        match &report.outcome("ETHUSDT").unwrap().action {
            CycleAction::Skipped { reason } => assert!(reason.contains("circuit breaker")),
            other => panic!("expected a breaker skip, got {:?}", other),
        }
        assert!(engine.ledger().snapshot().open_positions.is_empty());
        assert!(engine.get_status().await.breaker_tripped);
    }

    #[tokio::test]
    async fn test_emergency_stop_blocks_in_flight_entry() {
        let feed = GatedFeed::new("BTCUSDT");
        let mut config = test_config();
        config.liquidate_on_emergency = true;
        let engine = TradingEngine::with_strategies(config, feed.clone(), bullish_manager(), None)
            .await
            .unwrap();

        let operator = async {
            feed.entered.notified().await;
            let exits = engine.emergency_stop().await;
            let open_at_stop = engine.ledger().snapshot().open_positions.len();
            feed.release.notify_one();
            (exits, open_at_stop)
        };
        let (report, (exits, open_at_stop)) = tokio::join!(engine.force_analysis(), operator);

        assert!(exits.is_empty());
        assert_eq!(open_at_stop, 0);
        assert_eq!(
            report.outcome("BTCUSDT").unwrap().action,
            CycleAction::Skipped {
                reason: "emergency stop active".to_string()
            }
        );
        assert!(engine.ledger().snapshot().open_positions.is_empty());
    }

    #[tokio::test]
    async fn test_unwritten_trades_stay_on_ledger_until_stored() {
        let store = Arc::new(FlakyStore {
            inner: SqlStateStore::connect("sqlite::memory:").await.unwrap(),
            fail_appends: AtomicBool::new(true),
        });
        let shared: Arc<dyn StateStore> = store.clone();
        let engine = TradingEngine::with_strategies(
            test_config(),
            ScriptedFeed::new(100.0),
            bullish_manager(),
            Some(shared),
        )
        .await
        .unwrap();

        assert_eq!(engine.force_analysis().await.opened(), 1);
        assert!(store.trade_history(10).await.unwrap().is_empty());
        assert_eq!(engine.ledger().read(|l| l.history().len()).await, 1);

        store.fail_appends.store(false, Ordering::SeqCst);
        let tick = engine.force_monitor().await;
        assert_eq!(tick.repriced, 1);

        let stored = store.trade_history(10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].action, TradeAction::Open);
        assert_eq!(engine.ledger().read(|l| l.history().len()).await, 0);
    }

    #[tokio::test]
    async fn test_trades_kept_in_memory_without_store() {
        let feed = ScriptedFeed::new(100.0);
        let engine = engine(feed.clone(), test_config()).await;
        engine.force_analysis().await;
        let stop = engine.ledger().snapshot().open_positions[0].stop_loss;
        feed.set(stop - 1.0);
        engine.force_monitor().await;

        let actions: Vec<TradeAction> = engine
            .ledger()
            .read(|l| l.history().iter().map(|r| r.action).collect())
            .await;
        assert_eq!(actions, vec![TradeAction::Open, TradeAction::Close]);
    }
}
