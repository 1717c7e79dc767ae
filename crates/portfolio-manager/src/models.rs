use analysis_core::TradeSide;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    ClosedProfit,
    ClosedLoss,
    ClosedStop,
    ClosedTarget,
}

impl PositionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, PositionStatus::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::ClosedProfit => "CLOSED_PROFIT",
            PositionStatus::ClosedLoss => "CLOSED_LOSS",
            PositionStatus::ClosedStop => "CLOSED_STOP",
            PositionStatus::ClosedTarget => "CLOSED_TARGET",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
    Liquidation,
    EmergencyStop,
}

impl ExitReason {
    /// Terminal status for a close with the given net PnL. Stop and target
    /// exits keep their own status regardless of sign.
    pub fn terminal_status(&self, net_pnl: Decimal) -> PositionStatus {
        match self {
            ExitReason::StopLoss => PositionStatus::ClosedStop,
            ExitReason::TakeProfit => PositionStatus::ClosedTarget,
            ExitReason::Manual | ExitReason::Liquidation | ExitReason::EmergencyStop => {
                if net_pnl > Decimal::ZERO {
                    PositionStatus::ClosedProfit
                } else {
                    PositionStatus::ClosedLoss
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::Manual => "MANUAL",
            ExitReason::Liquidation => "LIQUIDATION",
            ExitReason::EmergencyStop => "EMERGENCY_STOP",
        }
    }
}

/// A simulated position. Prices are f64 market quotes; money that moves
/// through the ledger (fees, realized PnL) is kept as `Decimal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Set once the trade has moved far enough in our favour.
    pub trailing_stop: Option<f64>,
    /// Trail distance as a fraction of price.
    pub trailing_distance: f64,
    pub last_price: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    /// Net of entry and exit fees.
    pub realized_pnl: Option<Decimal>,
    pub entry_fee: Decimal,
    pub exit_fee: Decimal,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn entry_notional(&self) -> f64 {
        self.entry_price * self.quantity
    }

    /// Direction-aware gross PnL at `price`.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * self.quantity
    }

    pub fn unrealized_pnl_percent(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.entry_price * 100.0
    }

    /// Value this position contributes to equity. Shorts hold their entry
    /// notional as collateral, so their value is collateral plus PnL.
    pub fn market_value(&self, price: f64) -> f64 {
        match self.side {
            TradeSide::Buy => price * self.quantity,
            TradeSide::Sell => self.entry_notional() + self.unrealized_pnl(price),
        }
    }

    /// The tighter of the fixed stop and the trailing stop.
    pub fn effective_stop(&self) -> f64 {
        match (self.side, self.trailing_stop) {
            (TradeSide::Buy, Some(trail)) => self.stop_loss.max(trail),
            (TradeSide::Sell, Some(trail)) => self.stop_loss.min(trail),
            (_, None) => self.stop_loss,
        }
    }

    pub fn stop_hit(&self, price: f64) -> bool {
        let stop = self.effective_stop();
        match self.side {
            TradeSide::Buy => price <= stop,
            TradeSide::Sell => price >= stop,
        }
    }

    pub fn target_hit(&self, price: f64) -> bool {
        match self.side {
            TradeSide::Buy => price >= self.take_profit,
            TradeSide::Sell => price <= self.take_profit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    Open,
    Close,
}

/// One line of the append-only trade history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub position_id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub action: TradeAction,
    pub price: f64,
    pub quantity: f64,
    pub fee: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub reason: Option<ExitReason>,
    pub timestamp: DateTime<Utc>,
}
