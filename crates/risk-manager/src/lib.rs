pub mod assessor;
pub mod circuit_breaker;
pub mod error;
pub mod models;

pub use assessor::{RiskAssessor, FALLBACK_RISK_SCORE};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState};
pub use error::RiskError;
pub use models::*;
