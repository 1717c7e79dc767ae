use async_trait::async_trait;

use crate::{AnalysisError, Bar, PriceQuote, StrategyOpinion, Timeframe};

/// A single strategy that turns a bar series into a directional opinion.
///
/// Returning `Ok(None)` means the unit abstains for this tick. Errors are
/// treated the same way by the caller: the unit is excluded from the tally,
/// never counted as HOLD.
#[async_trait]
pub trait StrategyUnit: Send + Sync {
    fn id(&self) -> &str;

    async fn evaluate(
        &self,
        symbol: &str,
        bars: &[Bar],
    ) -> Result<Option<StrategyOpinion>, AnalysisError>;
}

/// Market-data collaborator (exchange connectivity lives behind this trait).
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, AnalysisError>;

    /// `Ok(None)` when no price is currently available for the symbol.
    async fn get_price(&self, symbol: &str) -> Result<Option<PriceQuote>, AnalysisError>;
}
