use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Rejections raised by the ledger. A failed call leaves the ledger untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("an open position already exists for {0}")]
    DuplicateOpenPosition(String),

    #[error("no open position for {0}")]
    PositionNotFound(String),

    #[error("position {0} is already closed")]
    AlreadyClosed(Uuid),

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("invalid quantity: {0}")]
    InvalidQuantity(f64),

    #[error("invalid price: {0}")]
    InvalidPrice(f64),

    #[error("cannot represent {0} as a decimal amount")]
    Conversion(f64),
}

/// Structured failure from the execution simulator. Callers must check for it
/// before treating an order as filled.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("stale quote for {symbol}: {age_seconds}s old (max {max_seconds}s)")]
    StaleQuote {
        symbol: String,
        age_seconds: i64,
        max_seconds: i64,
    },

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ExecutionError {
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            ExecutionError::Ledger(LedgerError::InsufficientFunds { .. })
        )
    }
}
