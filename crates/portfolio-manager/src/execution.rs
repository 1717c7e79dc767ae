use analysis_core::{PriceQuote, TradeSide};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExecutionError, LedgerError};
use crate::ledger::{to_decimal, PositionLedger};
use crate::models::{ExitReason, Position, PositionStatus};

/// Simulated trading costs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Fee charged on notional, per side (0.001 = 0.1%)
    pub fee_rate: f64,
    /// Adverse slippage in basis points
    pub slippage_bps: f64,
    /// Quotes older than this are refused
    pub max_quote_age_secs: i64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fee_rate: 0.001,
            slippage_bps: 5.0,
            max_quote_age_secs: 60,
        }
    }
}

/// An approved entry handed to the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub quote: PriceQuote,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trailing_distance: f64,
}

/// Applies orders to a [`PositionLedger`] as if they had been filled.
///
/// Nothing touches the ledger until every check has passed.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSimulator {
    config: ExecutionConfig,
}

impl ExecutionSimulator {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Fill price after adverse slippage. Buying pays up, selling gives up.
    pub fn fill_price(&self, fill_side: TradeSide, price: f64) -> f64 {
        let slip = self.config.slippage_bps / 10_000.0;
        match fill_side {
            TradeSide::Buy => price * (1.0 + slip),
            TradeSide::Sell => price * (1.0 - slip),
        }
    }

    fn check_fresh(&self, symbol: &str, quote: &PriceQuote, now: DateTime<Utc>) -> Result<(), ExecutionError> {
        let age = (now - quote.timestamp).num_seconds();
        if age > self.config.max_quote_age_secs {
            return Err(ExecutionError::StaleQuote {
                symbol: symbol.to_string(),
                age_seconds: age,
                max_seconds: self.config.max_quote_age_secs,
            });
        }
        Ok(())
    }

    pub fn open(
        &self,
        ledger: &mut PositionLedger,
        order: OpenOrder,
        now: DateTime<Utc>,
    ) -> Result<Position, ExecutionError> {
        if !order.quantity.is_finite() || order.quantity <= 0.0 {
            return Err(LedgerError::InvalidQuantity(order.quantity).into());
        }
        if !order.quote.price.is_finite() || order.quote.price <= 0.0 {
            return Err(LedgerError::InvalidPrice(order.quote.price).into());
        }
        self.check_fresh(&order.symbol, &order.quote, now)?;

        let stop_ok = match order.side {
            TradeSide::Buy => order.stop_loss < order.quote.price,
            TradeSide::Sell => order.stop_loss > order.quote.price,
        };
        if !order.stop_loss.is_finite() || order.stop_loss <= 0.0 || !stop_ok {
            return Err(ExecutionError::InvalidOrder(format!(
                "stop {:.4} is on the wrong side of {} entry {:.4}",
                order.stop_loss, order.side, order.quote.price
            )));
        }
        if ledger.has_open(&order.symbol) {
            return Err(LedgerError::DuplicateOpenPosition(order.symbol).into());
        }

        let entry_price = self.fill_price(order.side, order.quote.price);
        let notional = to_decimal(entry_price * order.quantity)?;
        let fee = to_decimal(entry_price * order.quantity * self.config.fee_rate)?;

        let position = Position {
            id: Uuid::new_v4(),
            symbol: order.symbol,
            side: order.side,
            entry_price,
            quantity: order.quantity,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            trailing_stop: None,
            trailing_distance: order.trailing_distance,
            last_price: order.quote.price,
            opened_at: now,
            closed_at: None,
            status: PositionStatus::Open,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
            entry_fee: fee,
            exit_fee: rust_decimal::Decimal::ZERO,
        };

        ledger.record_open(position.clone(), notional + fee)?;

        tracing::info!(
            "Opened {} {} x {:.6} @ {:.4} (stop {:.4}, target {:.4}, fee {})",
            position.side,
            position.symbol,
            position.quantity,
            position.entry_price,
            position.stop_loss,
            position.take_profit,
            fee
        );

        Ok(position)
    }

    /// Close the open position for `symbol` against a fresh quote.
    pub fn close(
        &self,
        ledger: &mut PositionLedger,
        symbol: &str,
        quote: PriceQuote,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<Position, ExecutionError> {
        self.check_fresh(symbol, &quote, now)?;
        self.close_at(ledger, symbol, quote.price, reason, now)
    }

    /// Close at the last price the ledger has seen for the position. Used for
    /// forced liquidation, where no fresh quote may be available.
    pub fn close_at_last_price(
        &self,
        ledger: &mut PositionLedger,
        symbol: &str,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<Position, ExecutionError> {
        let last = ledger
            .open_position(symbol)
            .map(|p| p.last_price)
            .ok_or_else(|| LedgerError::PositionNotFound(symbol.to_string()))?;
        self.close_at(ledger, symbol, last, reason, now)
    }

    fn close_at(
        &self,
        ledger: &mut PositionLedger,
        symbol: &str,
        price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<Position, ExecutionError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(LedgerError::InvalidPrice(price).into());
        }
        let (side, quantity) = ledger
            .open_position(symbol)
            .map(|p| (p.side, p.quantity))
            .ok_or_else(|| LedgerError::PositionNotFound(symbol.to_string()))?;

        // Closing a long sells, closing a short buys back.
        let fill_side = match side {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        };
        let exit_price = self.fill_price(fill_side, price);
        let fee = to_decimal(exit_price * quantity * self.config.fee_rate)?;

        let closed = ledger.record_close(symbol, exit_price, fee, reason, now)?;

        tracing::info!(
            "Closed {} {} @ {:.4} ({}) pnl {}",
            closed.side,
            closed.symbol,
            exit_price,
            reason.as_str(),
            closed.realized_pnl.unwrap_or_default()
        );

        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Duration;
    use rust_decimal::prelude::*;
    use rust_decimal_macros::dec;

    fn sim(slippage_bps: f64) -> ExecutionSimulator {
        ExecutionSimulator::new(ExecutionConfig {
            fee_rate: 0.001,
            slippage_bps,
            max_quote_age_secs: 30,
        })
    }

    fn order(side: TradeSide, price: f64, stop: f64, at: DateTime<Utc>) -> OpenOrder {
        OpenOrder {
            symbol: "BTC-USD".to_string(),
            side,
            quantity: 2.0,
            quote: PriceQuote::new(price, at),
            stop_loss: stop,
            take_profit: if side == TradeSide::Buy { price * 1.1 } else { price * 0.9 },
            trailing_distance: 0.05,
        }
    }

    #[test]
    fn test_open_long_debits_notional_and_fee() {
        let now = Utc::now();
        let mut ledger = PositionLedger::new(dec!(10000));
        let pos = sim(0.0)
            .open(&mut ledger, order(TradeSide::Buy, 100.0, 95.0, now), now)
            .unwrap();

        assert_eq!(pos.entry_fee, dec!(0.2));
        assert_eq!(ledger.cash_balance(), dec!(9799.8));
        assert!(pos.is_open());
    }

    #[test]
    fn test_slippage_is_adverse() {
        let s = sim(10.0);
        assert_relative_eq!(s.fill_price(TradeSide::Buy, 100.0), 100.1, epsilon = 1e-9);
        assert_relative_eq!(s.fill_price(TradeSide::Sell, 100.0), 99.9, epsilon = 1e-9);
    }

    #[test]
    fn test_short_round_trip() {
        let now = Utc::now();
        let s = sim(0.0);
        let mut ledger = PositionLedger::new(dec!(10000));
        s.open(&mut ledger, order(TradeSide::Sell, 100.0, 105.0, now), now)
            .unwrap();

        let closed = s
            .close(&mut ledger, "BTC-USD", PriceQuote::new(90.0, now), ExitReason::TakeProfit, now)
            .unwrap();

        // gross +20, fees 0.2 + 0.18
        assert_eq!(closed.realized_pnl, Some(dec!(19.62)));
        assert_eq!(closed.status, PositionStatus::ClosedTarget);
        assert_eq!(ledger.cash_balance(), dec!(10019.62));
    }

    #[test]
    fn test_stale_quote_rejected() {
        let now = Utc::now();
        let mut ledger = PositionLedger::new(dec!(10000));
        let stale = order(TradeSide::Buy, 100.0, 95.0, now - Duration::seconds(120));

        let err = sim(0.0).open(&mut ledger, stale, now).unwrap_err();
        assert!(matches!(err, ExecutionError::StaleQuote { .. }));
        assert_eq!(ledger.cash_balance(), dec!(10000));
    }

    #[test]
    fn test_wrong_side_stop_rejected() {
        let now = Utc::now();
        let mut ledger = PositionLedger::new(dec!(10000));
        let err = sim(0.0)
            .open(&mut ledger, order(TradeSide::Buy, 100.0, 101.0, now), now)
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidOrder(_)));
        assert_eq!(ledger.open_count(), 0);
    }

    #[test]
    fn test_insufficient_funds_is_structured() {
        let now = Utc::now();
        let mut ledger = PositionLedger::new(dec!(100));
        let err = sim(0.0)
            .open(&mut ledger, order(TradeSide::Buy, 100.0, 95.0, now), now)
            .unwrap_err();
        assert!(err.is_insufficient_funds());
        assert_eq!(ledger.cash_balance(), dec!(100));
    }

    #[test]
    fn test_liquidation_uses_last_price() {
        let now = Utc::now();
        let s = sim(0.0);
        let mut ledger = PositionLedger::new(dec!(10000));
        s.open(&mut ledger, order(TradeSide::Buy, 100.0, 95.0, now), now)
            .unwrap();
        ledger.mark_price("BTC-USD", 97.0).unwrap();

        let closed = s
            .close_at_last_price(&mut ledger, "BTC-USD", ExitReason::Liquidation, now + Duration::hours(2))
            .unwrap();
        assert_relative_eq!(closed.exit_price.unwrap(), 97.0);
        assert_eq!(closed.status, PositionStatus::ClosedLoss);
        assert!(closed.realized_pnl.unwrap().to_f64().unwrap() < 0.0);
    }
}
