use std::sync::Arc;

use analysis_core::{PriceQuote, TradeSide};
use chrono::{DateTime, Utc};
use portfolio_manager::{
    ExecutionSimulator, ExitReason, Position, PositionLedger, SharedLedger,
};
use rust_decimal::Decimal;

use crate::config::SupervisorConfig;
use crate::price_cache::PriceCache;

/// A position the supervisor (or a liquidation) closed.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub position: Position,
    pub reason: ExitReason,
    pub profitable: bool,
}

impl ExitEvent {
    fn from_closed(position: Position, reason: ExitReason) -> Self {
        let profitable = position.realized_pnl.is_some_and(|pnl| pnl > Decimal::ZERO);
        Self {
            position,
            reason,
            profitable,
        }
    }

    pub fn pnl(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.position
            .realized_pnl
            .and_then(|p| p.to_f64())
            .unwrap_or(0.0)
    }
}

/// Outcome of one monitor tick.
#[derive(Debug, Clone, Default)]
pub struct SupervisorTick {
    pub repriced: usize,
    pub exits: Vec<ExitEvent>,
    /// Symbols with no usable price this tick; their positions were left as is.
    pub unpriced: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TickQuotes {
    pub priced: Vec<(String, PriceQuote)>,
    pub unpriced: Vec<String>,
}

impl TickQuotes {
    pub fn is_empty(&self) -> bool {
        self.priced.is_empty() && self.unpriced.is_empty()
    }
}

/// Re-prices open positions, ratchets trailing stops, pushes out take-profit
/// targets and closes positions whose stop or target has been crossed.
pub struct PositionSupervisor {
    config: SupervisorConfig,
    simulator: ExecutionSimulator,
    prices: Arc<PriceCache>,
}

impl PositionSupervisor {
    pub fn new(config: SupervisorConfig, simulator: ExecutionSimulator, prices: Arc<PriceCache>) -> Self {
        Self {
            config,
            simulator,
            prices,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub async fn tick(&self, ledger: &SharedLedger) -> SupervisorTick {
        self.tick_at(ledger, Utc::now()).await
    }

    /// Prices are fetched before the ledger lock is taken. All position
    /// updates of the tick then happen under one lock, so exactly one
    /// snapshot is published per tick.
    pub async fn tick_at(&self, ledger: &SharedLedger, now: DateTime<Utc>) -> SupervisorTick {
        let quotes = self.fetch_quotes(ledger).await;
        if quotes.is_empty() {
            return SupervisorTick::default();
        }
        let mut tick = ledger
            .with_ledger(|ledger| self.apply(ledger, &quotes.priced, now))
            .await;
        tick.unpriced.extend(quotes.unpriced);
        tick
    }

    /// Current quotes for every open position. Symbols without a usable
    /// price (missing, failed or timed out) are listed separately.
    pub async fn fetch_quotes(&self, ledger: &SharedLedger) -> TickQuotes {
        let symbols: Vec<String> = ledger
            .snapshot()
            .open_positions
            .iter()
            .map(|p| p.symbol.clone())
            .collect();

        let mut quotes = TickQuotes::default();
        for symbol in symbols {
            match self.prices.get(&symbol).await {
                Ok(Some(quote)) => quotes.priced.push((symbol, quote)),
                Ok(None) => {
                    tracing::debug!("No price for {}, skipping this tick", symbol);
                    quotes.unpriced.push(symbol);
                }
                Err(e) => {
                    tracing::warn!("Price fetch for {} failed: {}", symbol, e);
                    quotes.unpriced.push(symbol);
                }
            }
        }
        quotes
    }

    /// Apply one round of quotes to the ledger.
    pub fn apply(
        &self,
        ledger: &mut PositionLedger,
        quotes: &[(String, PriceQuote)],
        now: DateTime<Utc>,
    ) -> SupervisorTick {
        let mut tick = SupervisorTick::default();

        for (symbol, quote) in quotes {
            let Some(position) = ledger.open_position(symbol).cloned() else {
                continue;
            };
            let price = quote.price;

            if let Err(e) = ledger.mark_price(symbol, price) {
                tick.errors.push(format!("{}: {}", symbol, e));
                continue;
            }
            tick.repriced += 1;

            let mut updated = position.clone();
            updated.trailing_stop = self.next_trailing_stop(&position, price);

            let reason = if updated.stop_hit(price) {
                Some(ExitReason::StopLoss)
            } else if updated.target_hit(price) {
                Some(ExitReason::TakeProfit)
            } else {
                None
            };

            if let Some(reason) = reason {
                match self.simulator.close(ledger, symbol, *quote, reason, now) {
                    Ok(closed) => {
                        tracing::info!(
                            symbol = %symbol,
                            reason = reason.as_str(),
                            price = price,
                            pnl = %closed.realized_pnl.unwrap_or_default(),
                            "Position closed"
                        );
                        tick.exits.push(ExitEvent::from_closed(closed, reason));
                    }
                    Err(e) => {
                        tracing::warn!("Could not close {} on {}: {}", symbol, reason.as_str(), e);
                        tick.errors.push(format!("{}: {}", symbol, e));
                    }
                }
                continue;
            }

            updated.take_profit = self.next_take_profit(&updated, price);
            if updated.trailing_stop != position.trailing_stop
                || updated.take_profit != position.take_profit
            {
                if let Err(e) = ledger.adjust_exits(symbol, updated.trailing_stop, updated.take_profit) {
                    tick.errors.push(format!("{}: {}", symbol, e));
                } else {
                    tracing::debug!(
                        "{} exits now stop {:.4} / target {:.4}",
                        symbol,
                        updated.effective_stop(),
                        updated.take_profit
                    );
                }
            }
        }

        tick
    }

    fn trail_fraction(&self, position: &Position) -> f64 {
        let d = position.trailing_distance;
        if d.is_finite() && d > 0.0 && d < 1.0 {
            d
        } else {
            self.config.default_trail_percent / 100.0
        }
    }

    /// The trailing stop only ever moves in the position's favour. It stays
    /// unset until the unrealized gain reaches the activation threshold.
    pub fn next_trailing_stop(&self, position: &Position, price: f64) -> Option<f64> {
        let current = position.trailing_stop;
        if current.is_none()
            && position.unrealized_pnl_percent(price) < self.config.trailing_activation_percent
        {
            return None;
        }

        let trail = self.trail_fraction(position);
        match position.side {
            TradeSide::Buy => {
                let candidate = price * (1.0 - trail);
                Some(current.map_or(candidate, |c| c.max(candidate)))
            }
            TradeSide::Sell => {
                let candidate = price * (1.0 + trail);
                Some(current.map_or(candidate, |c| c.min(candidate)))
            }
        }
    }

    /// Push the target further out once price has covered most of the way to
    /// it, by a step proportional to the position's trail distance. Only
    /// positions whose trailing stop is engaged are extended.
    pub fn next_take_profit(&self, position: &Position, price: f64) -> f64 {
        let target = position.take_profit;
        if position.trailing_stop.is_none() {
            return target;
        }

        let sign = position.side.sign();
        let total = (target - position.entry_price) * sign;
        if total <= 0.0 {
            return target;
        }
        let progress = (price - position.entry_price) * sign / total;
        if progress < self.config.take_profit_extension_trigger || progress >= 1.0 {
            return target;
        }

        let step = price * self.trail_fraction(position) * self.config.take_profit_extension_multiple;
        let extended = target + sign * step;
        if extended > 0.0 {
            extended
        } else {
            target
        }
    }

    /// Close every open position at its last known price.
    pub fn liquidate(
        &self,
        ledger: &mut PositionLedger,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Vec<ExitEvent> {
        let symbols: Vec<String> = ledger.open_positions().map(|p| p.symbol.clone()).collect();
        let mut exits = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match self.simulator.close_at_last_price(ledger, &symbol, reason, now) {
                Ok(closed) => exits.push(ExitEvent::from_closed(closed, reason)),
                Err(e) => tracing::error!("Liquidation of {} failed: {}", symbol, e),
            }
        }
        if !exits.is_empty() {
            tracing::warn!("Liquidated {} position(s) ({})", exits.len(), reason.as_str());
        }
        exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::{AnalysisError, Bar, MarketDataProvider, Timeframe};
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use portfolio_manager::{ExecutionConfig, OpenOrder, PositionStatus};
    use proptest::prelude::*;

    struct NoPrices;

    #[async_trait]
    impl MarketDataProvider for NoPrices {
        async fn get_ohlcv(&self, _: &str, _: Timeframe, _: usize) -> Result<Vec<Bar>, AnalysisError> {
            Ok(Vec::new())
        }

        async fn get_price(&self, _: &str) -> Result<Option<PriceQuote>, AnalysisError> {
            Ok(None)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 9, 0, 0).unwrap()
    }

    fn frictionless() -> ExecutionSimulator {
        ExecutionSimulator::new(ExecutionConfig {
            fee_rate: 0.0,
            slippage_bps: 0.0,
            max_quote_age_secs: 60,
        })
    }

    fn supervisor() -> PositionSupervisor {
        PositionSupervisor::new(
            SupervisorConfig::default(),
            frictionless(),
            Arc::new(PriceCache::new(
                Arc::new(NoPrices),
                std::time::Duration::from_secs(5),
                std::time::Duration::from_secs(1),
            )),
        )
    }

    fn ledger_with(side: TradeSide, stop: f64, target: f64) -> PositionLedger {
        let mut ledger = PositionLedger::new(Decimal::from(100_000));
        frictionless()
            .open(
                &mut ledger,
                OpenOrder {
                    symbol: "BTCUSDT".to_string(),
                    side,
                    quantity: 10.0,
                    quote: PriceQuote::new(100.0, t0()),
                    stop_loss: stop,
                    take_profit: target,
                    trailing_distance: 0.03,
                },
                t0(),
            )
            .unwrap();
        ledger
    }

    fn quote(price: f64) -> Vec<(String, PriceQuote)> {
        vec![("BTCUSDT".to_string(), PriceQuote::new(price, t0()))]
    }

    #[test]
    fn test_trailing_engages_after_activation() {
        let sv = supervisor();
        let mut ledger = ledger_with(TradeSide::Buy, 97.0, 120.0);

        sv.apply(&mut ledger, &quote(100.5), t0());
        assert_eq!(ledger.open_position("BTCUSDT").unwrap().trailing_stop, None);

        sv.apply(&mut ledger, &quote(105.0), t0());
        let trail = ledger.open_position("BTCUSDT").unwrap().trailing_stop.unwrap();
        assert_relative_eq!(trail, 105.0 * 0.97, epsilon = 1e-9);

        // A dip does not loosen it.
        sv.apply(&mut ledger, &quote(103.0), t0());
        let after_dip = ledger.open_position("BTCUSDT").unwrap().trailing_stop.unwrap();
        assert_relative_eq!(after_dip, trail);
    }

    #[test]
    fn test_trailing_stop_exit_is_a_stop() {
        let sv = supervisor();
        let mut ledger = ledger_with(TradeSide::Buy, 97.0, 120.0);
        sv.apply(&mut ledger, &quote(110.0), t0());

        // 106.7 is the trail; 106 crosses it while still in profit.
        let tick = sv.apply(&mut ledger, &quote(106.0), t0());
        assert_eq!(tick.exits.len(), 1);
        let exit = &tick.exits[0];
        assert_eq!(exit.reason, ExitReason::StopLoss);
        assert_eq!(exit.position.status, PositionStatus::ClosedStop);
        assert!(exit.profitable);
        assert!(!ledger.has_open("BTCUSDT"));
    }

    #[test]
    fn test_stop_checked_before_target() {
        let sv = supervisor();
        // Degenerate levels: one price crosses both.
        let mut ledger = ledger_with(TradeSide::Sell, 101.0, 99.0);
        ledger.adjust_exits("BTCUSDT", None, 150.0).unwrap();
        let tick = sv.apply(&mut ledger, &quote(102.0), t0());
        assert_eq!(tick.exits[0].reason, ExitReason::StopLoss);
        assert!(!tick.exits[0].profitable);
    }

    #[test]
    fn test_take_profit_exit() {
        let sv = supervisor();
        let mut ledger = ledger_with(TradeSide::Sell, 103.0, 94.0);
        let tick = sv.apply(&mut ledger, &quote(93.5), t0());
        assert_eq!(tick.exits.len(), 1);
        assert_eq!(tick.exits[0].reason, ExitReason::TakeProfit);
        assert_eq!(tick.exits[0].position.status, PositionStatus::ClosedTarget);
        assert!(tick.exits[0].profitable);
    }

    #[test]
    fn test_target_extends_near_completion() {
        let sv = supervisor();
        let mut ledger = ledger_with(TradeSide::Buy, 97.0, 110.0);
        // 85% of the way to target with trailing engaged.
        sv.apply(&mut ledger, &quote(108.5), t0());
        let p = ledger.open_position("BTCUSDT").unwrap();
        assert!(p.trailing_stop.is_some());
        assert_relative_eq!(p.take_profit, 110.0 + 108.5 * 0.03, epsilon = 1e-9);
    }

    #[test]
    fn test_liquidate_closes_everything() {
        let sv = supervisor();
        let mut ledger = ledger_with(TradeSide::Buy, 97.0, 110.0);
        ledger.mark_price("BTCUSDT", 99.0).unwrap();
        let exits = sv.liquidate(&mut ledger, ExitReason::Liquidation, t0());
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].position.exit_price, Some(99.0));
        assert_eq!(exits[0].position.status, PositionStatus::ClosedLoss);
        assert_eq!(ledger.open_count(), 0);
    }

    #[tokio::test]
    async fn test_unpriced_positions_are_left_alone() {
        let sv = supervisor();
        let shared = SharedLedger::new(ledger_with(TradeSide::Buy, 97.0, 110.0));
        let tick = sv.tick_at(&shared, t0()).await;
        assert_eq!(tick.unpriced, vec!["BTCUSDT".to_string()]);
        assert_eq!(tick.repriced, 0);
        assert_eq!(shared.snapshot().open_positions.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_long_trailing_stop_never_loosens(
            moves in proptest::collection::vec(-0.02f64..0.03, 1..40),
        ) {
            let sv = supervisor();
            // Stop and target far away so the position survives the walk.
            let mut ledger = ledger_with(TradeSide::Buy, 1.0, 10_000.0);
            let mut price = 100.0;
            let mut last_trail: Option<f64> = None;

            for m in moves {
                price *= 1.0 + m;
                sv.apply(&mut ledger, &quote(price), t0());
                let Some(p) = ledger.open_position("BTCUSDT") else { break };
                if let (Some(prev), Some(now)) = (last_trail, p.trailing_stop) {
                    prop_assert!(now >= prev);
                }
                if last_trail.is_some() {
                    prop_assert!(p.trailing_stop.is_some());
                }
                last_trail = p.trailing_stop;
            }
        }
    }
}
