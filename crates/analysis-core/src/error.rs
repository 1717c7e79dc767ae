use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Calculation error: {0}")]
    CalculationError(String),

    /// The market-data collaborator could not serve the request.
    #[error("Data unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl AnalysisError {
    /// Input/data errors make a strategy abstain; anything else is a failure
    /// worth surfacing at warn level.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            AnalysisError::InsufficientData(_)
                | AnalysisError::InvalidData(_)
                | AnalysisError::Unavailable(_)
        )
    }
}
