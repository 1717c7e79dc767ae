use std::sync::Arc;

use analysis_core::{AnalysisError, MarketDataProvider, PriceQuote};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

struct CacheEntry {
    quote: PriceQuote,
    cached_at: DateTime<Utc>,
}

/// Short-TTL memo in front of `MarketDataProvider::get_price`, shared by the
/// monitor loop and the analysis loop. Every provider call is bounded by
/// `fetch_timeout`.
pub struct PriceCache {
    provider: Arc<dyn MarketDataProvider>,
    ttl: Duration,
    fetch_timeout: std::time::Duration,
    entries: DashMap<String, CacheEntry>,
}

impl PriceCache {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        ttl: std::time::Duration,
        fetch_timeout: std::time::Duration,
    ) -> Self {
        Self {
            provider,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(5)),
            fetch_timeout,
            entries: DashMap::new(),
        }
    }

    pub async fn get(&self, symbol: &str) -> Result<Option<PriceQuote>, AnalysisError> {
        self.get_at(symbol, Utc::now()).await
    }

    pub async fn get_at(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PriceQuote>, AnalysisError> {
        if let Some(entry) = self.entries.get(symbol) {
            if now - entry.cached_at < self.ttl {
                return Ok(Some(entry.quote));
            }
        }

        // The guard above is dropped before awaiting the provider.
        let quote = tokio::time::timeout(self.fetch_timeout, self.provider.get_price(symbol))
            .await
            .map_err(|_| AnalysisError::Timeout {
                operation: format!("price fetch for {}", symbol),
                timeout_ms: self.fetch_timeout.as_millis() as u64,
            })??;
        match quote {
            Some(quote) if quote.price.is_finite() && quote.price > 0.0 => {
                self.entries.insert(
                    symbol.to_string(),
                    CacheEntry {
                        quote,
                        cached_at: now,
                    },
                );
                Ok(Some(quote))
            }
            Some(quote) => Err(AnalysisError::InvalidData(format!(
                "unusable price {} for {}",
                quote.price, symbol
            ))),
            None => {
                self.entries.remove(symbol);
                Ok(None)
            }
        }
    }

    pub fn invalidate(&self, symbol: &str) {
        self.entries.remove(symbol);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
