//! Synthetic market data for running the engine without an exchange.
//!
//! Each symbol follows a bounded random walk. `get_price` advances the walk
//! by one step; `get_ohlcv` builds a bar history that ends at the current
//! price.

use analysis_core::{AnalysisError, Bar, MarketDataProvider, PriceQuote, Timeframe};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

const DEFAULT_START_PRICE: f64 = 100.0;

pub struct SyntheticFeed {
    prices: DashMap<String, f64>,
    /// Per-step volatility as a fraction of price.
    step_volatility: f64,
    rng: Mutex<StdRng>,
}

impl SyntheticFeed {
    pub fn new(seed: u64, step_volatility: f64) -> Self {
        Self {
            prices: DashMap::new(),
            step_volatility: step_volatility.abs().min(0.2),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn with_price(self, symbol: &str, price: f64) -> Self {
        self.prices.insert(symbol.to_string(), price);
        self
    }

    fn current(&self, symbol: &str) -> f64 {
        self.prices
            .get(symbol)
            .map(|p| *p)
            .unwrap_or(DEFAULT_START_PRICE)
    }

    /// Approximately normal step: the sum of four uniforms, rescaled.
    fn draw(rng: &mut StdRng) -> f64 {
        let sum: f64 = (0..4).map(|_| rng.gen_range(-1.0_f64..1.0)).sum();
        sum / 4.0_f64.sqrt() * 3.0_f64.sqrt()
    }

    fn step(&self, rng: &mut StdRng, price: f64) -> f64 {
        let next = price * (1.0 + Self::draw(rng) * self.step_volatility);
        next.max(price * 0.5).max(0.01)
    }
}

#[async_trait]
impl MarketDataProvider for SyntheticFeed {
    async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, AnalysisError> {
        if limit == 0 {
            return Err(AnalysisError::InvalidData("bar limit must be positive".into()));
        }
        let mut rng = self.rng.lock().await;
        let end_price = self.current(symbol);
        let bar_minutes = timeframe.to_minutes();
        let end = Utc::now();

        // Walk backwards from the current price, then emit oldest first.
        let mut closes = Vec::with_capacity(limit);
        let mut price = end_price;
        for _ in 0..limit {
            closes.push(price);
            price = self.step(&mut rng, price);
        }
        closes.reverse();

        let mut bars = Vec::with_capacity(limit);
        let mut open = closes[0];
        for (i, close) in closes.into_iter().enumerate() {
            let wick = close * self.step_volatility * rng.gen_range(0.1_f64..1.0);
            let high = open.max(close) + wick;
            let low = (open.min(close) - wick).max(0.01);
            bars.push(Bar {
                timestamp: end - Duration::minutes(bar_minutes * (limit - 1 - i) as i64),
                open,
                high,
                low,
                close,
                volume: rng.gen_range(500.0_f64..5_000.0),
                vwap: Some((high + low + close) / 3.0),
            });
            open = close;
        }
        Ok(bars)
    }

    async fn get_price(&self, symbol: &str) -> Result<Option<PriceQuote>, AnalysisError> {
        let mut rng = self.rng.lock().await;
        let next = self.step(&mut rng, self.current(symbol));
        self.prices.insert(symbol.to_string(), next);
        Ok(Some(PriceQuote::new(next, Utc::now())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_ends_at_current_price() {
        let feed = SyntheticFeed::new(7, 0.01).with_price("BTCUSDT", 50_000.0);
        let bars = feed.get_ohlcv("BTCUSDT", Timeframe::Hour1, 100).await.unwrap();
        assert_eq!(bars.len(), 100);
        assert_eq!(bars.last().unwrap().close, 50_000.0);
        assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(bars.iter().all(|b| b.low <= b.close && b.close <= b.high && b.low > 0.0));
    }

    #[tokio::test]
    async fn test_walk_is_seeded() {
        let a = SyntheticFeed::new(42, 0.02);
        let b = SyntheticFeed::new(42, 0.02);
        for _ in 0..10 {
            let pa = a.get_price("X").await.unwrap().unwrap().price;
            let pb = b.get_price("X").await.unwrap().unwrap().price;
            assert_eq!(pa, pb);
            assert!(pa > 0.0);
        }
    }

    #[tokio::test]
    async fn test_zero_limit_is_rejected() {
        let feed = SyntheticFeed::new(1, 0.01);
        assert!(feed.get_ohlcv("X", Timeframe::Minute5, 0).await.is_err());
    }
}
