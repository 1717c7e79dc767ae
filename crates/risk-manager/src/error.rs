use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("non-finite value while computing {0}")]
    NonFinite(&'static str),

    #[error("portfolio has no value to size against")]
    EmptyPortfolio,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Guard a computed value: NaN or infinity becomes a `RiskError`.
pub(crate) fn finite(value: f64, what: &'static str) -> Result<f64, RiskError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RiskError::NonFinite(what))
    }
}
