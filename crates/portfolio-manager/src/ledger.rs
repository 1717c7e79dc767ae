use std::collections::BTreeMap;
use std::sync::Arc;

use analysis_core::TradeSide;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{ExitReason, Position, TradeAction, TradeRecord};

/// Decimal places kept for money amounts derived from f64 prices.
const MONEY_DP: u32 = 8;

/// Closed positions kept in memory; older ones live only in the trade history
/// store.
const MAX_CLOSED_IN_MEMORY: usize = 500;

pub(crate) fn to_decimal(value: f64) -> Result<Decimal, LedgerError> {
    if !value.is_finite() {
        return Err(LedgerError::Conversion(value));
    }
    Decimal::from_f64(value)
        .map(|d| d.round_dp(MONEY_DP))
        .ok_or(LedgerError::Conversion(value))
}

/// Consistent view of the virtual portfolio at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub cash_balance: Decimal,
    /// Cash plus the market value of every open position.
    pub equity: Decimal,
    pub peak_equity: Decimal,
    /// Percent below `peak_equity`.
    pub current_drawdown: f64,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_fees: Decimal,
    pub open_positions: Vec<Position>,
    pub closed_count: usize,
    pub as_of: DateTime<Utc>,
}

impl PortfolioState {
    pub fn portfolio_value(&self) -> f64 {
        self.equity.to_f64().unwrap_or(0.0)
    }

    pub fn cash(&self) -> f64 {
        self.cash_balance.to_f64().unwrap_or(0.0)
    }

    pub fn has_open(&self, symbol: &str) -> bool {
        self.open_positions.iter().any(|p| p.symbol == symbol)
    }

    pub fn open_on_side(&self, side: TradeSide) -> usize {
        self.open_positions.iter().filter(|p| p.side == side).count()
    }
}

/// Authoritative record of open and closed positions and of the cash balance.
///
/// Every mutating method validates first and only then writes, so an `Err`
/// never leaves a half-applied change behind.
#[derive(Debug, Clone)]
pub struct PositionLedger {
    cash_balance: Decimal,
    realized_pnl: Decimal,
    total_fees: Decimal,
    peak_equity: Decimal,
    open: BTreeMap<String, Position>,
    closed: Vec<Position>,
    closed_count: usize,
    history: Vec<TradeRecord>,
}

impl PositionLedger {
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            cash_balance: initial_cash,
            realized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            peak_equity: initial_cash,
            open: BTreeMap::new(),
            closed: Vec::new(),
            closed_count: 0,
            history: Vec::new(),
        }
    }

    /// Rebuild a ledger from a persisted snapshot.
    pub fn from_state(state: PortfolioState) -> Result<Self, LedgerError> {
        let mut open = BTreeMap::new();
        for position in state.open_positions {
            if !position.is_open() {
                return Err(LedgerError::AlreadyClosed(position.id));
            }
            if open.contains_key(&position.symbol) {
                return Err(LedgerError::DuplicateOpenPosition(position.symbol));
            }
            open.insert(position.symbol.clone(), position);
        }

        Ok(Self {
            cash_balance: state.cash_balance,
            realized_pnl: state.realized_pnl,
            total_fees: state.total_fees,
            peak_equity: state.peak_equity,
            open,
            closed: Vec::new(),
            closed_count: state.closed_count,
            history: Vec::new(),
        })
    }

    pub fn cash_balance(&self) -> Decimal {
        self.cash_balance
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn has_open(&self, symbol: &str) -> bool {
        self.open.contains_key(symbol)
    }

    pub fn open_position(&self, symbol: &str) -> Option<&Position> {
        self.open.get(symbol)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.open.values()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn closed_positions(&self) -> &[Position] {
        &self.closed
    }

    pub fn history(&self) -> &[TradeRecord] {
        &self.history
    }

    pub fn equity(&self) -> Decimal {
        let positions: f64 = self
            .open
            .values()
            .map(|p| p.market_value(p.last_price))
            .sum();
        self.cash_balance + to_decimal(positions).unwrap_or_default()
    }

    pub fn snapshot(&self) -> PortfolioState {
        let equity = self.equity();
        let unrealized: f64 = self
            .open
            .values()
            .map(|p| p.unrealized_pnl(p.last_price))
            .sum();

        PortfolioState {
            cash_balance: self.cash_balance,
            equity,
            peak_equity: self.peak_equity,
            current_drawdown: drawdown_percent(self.peak_equity, equity),
            realized_pnl: self.realized_pnl,
            unrealized_pnl: to_decimal(unrealized).unwrap_or_default(),
            total_fees: self.total_fees,
            open_positions: self.open.values().cloned().collect(),
            closed_count: self.closed_count,
            as_of: Utc::now(),
        }
    }

    /// Insert a freshly filled position, debiting `cash_debit` (notional plus
    /// entry fee).
    pub fn record_open(&mut self, position: Position, cash_debit: Decimal) -> Result<(), LedgerError> {
        if self.open.contains_key(&position.symbol) {
            return Err(LedgerError::DuplicateOpenPosition(position.symbol));
        }
        if !position.is_open() {
            return Err(LedgerError::AlreadyClosed(position.id));
        }
        if cash_debit > self.cash_balance {
            return Err(LedgerError::InsufficientFunds {
                required: cash_debit,
                available: self.cash_balance,
            });
        }

        self.cash_balance -= cash_debit;
        self.total_fees += position.entry_fee;
        self.history.push(TradeRecord {
            id: Uuid::new_v4(),
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: position.side,
            action: TradeAction::Open,
            price: position.entry_price,
            quantity: position.quantity,
            fee: position.entry_fee,
            realized_pnl: None,
            reason: None,
            timestamp: position.opened_at,
        });
        self.open.insert(position.symbol.clone(), position);
        self.update_peak();
        Ok(())
    }

    /// Close the open position for `symbol` at `exit_price`, crediting back
    /// collateral plus gross PnL minus the exit fee.
    pub fn record_close(
        &mut self,
        symbol: &str,
        exit_price: f64,
        exit_fee: Decimal,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Result<Position, LedgerError> {
        if !exit_price.is_finite() || exit_price <= 0.0 {
            return Err(LedgerError::InvalidPrice(exit_price));
        }
        let current = self
            .open
            .get(symbol)
            .ok_or_else(|| LedgerError::PositionNotFound(symbol.to_string()))?;

        let gross = to_decimal(current.unrealized_pnl(exit_price))?;
        let collateral = to_decimal(current.entry_notional())?;
        let net = gross - current.entry_fee - exit_fee;

        let mut position = match self.open.remove(symbol) {
            Some(position) => position,
            None => return Err(LedgerError::PositionNotFound(symbol.to_string())),
        };

        self.cash_balance += collateral + gross - exit_fee;
        self.realized_pnl += net;
        self.total_fees += exit_fee;

        position.last_price = exit_price;
        position.exit_price = Some(exit_price);
        position.exit_reason = Some(reason);
        position.exit_fee = exit_fee;
        position.realized_pnl = Some(net);
        position.closed_at = Some(at);
        position.status = reason.terminal_status(net);

        self.history.push(TradeRecord {
            id: Uuid::new_v4(),
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: position.side,
            action: TradeAction::Close,
            price: exit_price,
            quantity: position.quantity,
            fee: exit_fee,
            realized_pnl: Some(net),
            reason: Some(reason),
            timestamp: at,
        });

        self.closed_count += 1;
        self.closed.push(position.clone());
        if self.closed.len() > MAX_CLOSED_IN_MEMORY {
            self.closed.remove(0);
        }
        self.update_peak();
        Ok(position)
    }

    pub fn mark_price(&mut self, symbol: &str, price: f64) -> Result<(), LedgerError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(LedgerError::InvalidPrice(price));
        }
        let position = self
            .open
            .get_mut(symbol)
            .ok_or_else(|| LedgerError::PositionNotFound(symbol.to_string()))?;
        position.last_price = price;
        self.update_peak();
        Ok(())
    }

    /// Replace the trailing stop and take-profit of an open position.
    pub fn adjust_exits(
        &mut self,
        symbol: &str,
        trailing_stop: Option<f64>,
        take_profit: f64,
    ) -> Result<(), LedgerError> {
        if let Some(stop) = trailing_stop {
            if !stop.is_finite() || stop <= 0.0 {
                return Err(LedgerError::InvalidPrice(stop));
            }
        }
        if !take_profit.is_finite() || take_profit <= 0.0 {
            return Err(LedgerError::InvalidPrice(take_profit));
        }
        let position = self
            .open
            .get_mut(symbol)
            .ok_or_else(|| LedgerError::PositionNotFound(symbol.to_string()))?;
        position.trailing_stop = trailing_stop;
        position.take_profit = take_profit;
        Ok(())
    }

    /// Drain trade records not yet handed to persistence.
    pub fn take_history(&mut self) -> Vec<TradeRecord> {
        std::mem::take(&mut self.history)
    }

    /// Put back records persistence could not write, ahead of anything
    /// recorded since they were drained.
    pub fn requeue_history(&mut self, mut records: Vec<TradeRecord>) {
        records.append(&mut self.history);
        self.history = records;
    }

    fn update_peak(&mut self) {
        let equity = self.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }
}

fn drawdown_percent(peak: Decimal, equity: Decimal) -> f64 {
    if peak <= Decimal::ZERO || equity >= peak {
        return 0.0;
    }
    ((peak - equity) / peak).to_f64().unwrap_or(0.0) * 100.0
}

/// Single-writer handle to the ledger shared by the analysis and monitor
/// loops.
///
/// All mutation goes through [`SharedLedger::with_ledger`], which holds the
/// lock for the whole closure and publishes exactly one snapshot afterwards.
/// Readers that only need numbers use [`SharedLedger::snapshot`] and never
/// observe a half-finished tick.
#[derive(Clone)]
pub struct SharedLedger {
    inner: Arc<Mutex<PositionLedger>>,
    snapshot_tx: Arc<watch::Sender<PortfolioState>>,
}

impl SharedLedger {
    pub fn new(ledger: PositionLedger) -> Self {
        let (snapshot_tx, _) = watch::channel(ledger.snapshot());
        Self {
            inner: Arc::new(Mutex::new(ledger)),
            snapshot_tx: Arc::new(snapshot_tx),
        }
    }

    pub async fn with_ledger<R>(&self, f: impl FnOnce(&mut PositionLedger) -> R) -> R {
        let mut guard = self.inner.lock().await;
        let out = f(&mut guard);
        self.snapshot_tx.send_replace(guard.snapshot());
        out
    }

    /// Read-only access under the lock. Publishes nothing.
    pub async fn read<R>(&self, f: impl FnOnce(&PositionLedger) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> PortfolioState {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PortfolioState> {
        self.snapshot_tx.subscribe()
    }
}
