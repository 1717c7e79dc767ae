pub mod error;
pub mod execution;
pub mod ledger;
pub mod models;

pub use error::{ExecutionError, LedgerError};
pub use execution::{ExecutionConfig, ExecutionSimulator, OpenOrder};
pub use ledger::{PortfolioState, PositionLedger, SharedLedger};
pub use models::*;
