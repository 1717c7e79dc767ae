use analysis_core::{indicators, AnalysisError, Bar, Direction, StrategyOpinion, StrategyUnit};
use async_trait::async_trait;

/// Each independent confirmation adds this much confidence.
const CONFLUENCE_BONUS: f64 = 5.0;
const MAX_CONFIDENCE: f64 = 95.0;

fn require_bars(bars: &[Bar], needed: usize, id: &str) -> Result<(), AnalysisError> {
    if bars.len() < needed {
        return Err(AnalysisError::InsufficientData(format!(
            "{} needs {} bars, got {}",
            id,
            needed,
            bars.len()
        )));
    }
    Ok(())
}

/// Last bar, if it carries a usable price. Otherwise the unit abstains.
fn last_priced(bars: &[Bar]) -> Option<&Bar> {
    bars.last().filter(|b| b.close.is_finite() && b.close > 0.0)
}

fn finish(
    id: &str,
    symbol: &str,
    bar: &Bar,
    direction: Direction,
    base_confidence: f64,
    confluence: u32,
    reason: String,
) -> StrategyOpinion {
    let confidence = if direction.is_directional() {
        (base_confidence + confluence as f64 * CONFLUENCE_BONUS).clamp(0.0, MAX_CONFIDENCE)
    } else {
        base_confidence.clamp(0.0, MAX_CONFIDENCE)
    };
    StrategyOpinion::new(id, symbol, direction, confidence, bar.close, bar.timestamp)
        .with_confluence(confluence)
        .with_reason(reason)
}

/// RSI plus rate of change: buys strength, sells weakness.
pub struct MomentumStrategy {
    pub rsi_period: usize,
    pub roc_lookback: usize,
}

impl Default for MomentumStrategy {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            roc_lookback: 10,
        }
    }
}

#[async_trait]
impl StrategyUnit for MomentumStrategy {
    fn id(&self) -> &str {
        "momentum"
    }

    async fn evaluate(
        &self,
        symbol: &str,
        bars: &[Bar],
    ) -> Result<Option<StrategyOpinion>, AnalysisError> {
        require_bars(bars, self.rsi_period.max(self.roc_lookback) + 1, self.id())?;
        let Some(last) = last_priced(bars) else {
            return Ok(None);
        };

        let closes = indicators::closes(bars);
        let rsi = indicators::rsi(&closes, self.rsi_period)
            .ok_or_else(|| AnalysisError::CalculationError("RSI unavailable".into()))?;
        let roc = indicators::rate_of_change(&closes, self.roc_lookback)
            .ok_or_else(|| AnalysisError::CalculationError("rate of change unavailable".into()))?;

        let direction = if rsi > 55.0 && roc > 0.0 {
            Direction::Buy
        } else if rsi < 45.0 && roc < 0.0 {
            Direction::Sell
        } else {
            Direction::Hold
        };

        let mut confluence = 0;
        if (direction == Direction::Buy && rsi > 60.0) || (direction == Direction::Sell && rsi < 40.0) {
            confluence += 1;
        }
        if roc.abs() > 2.0 && direction.is_directional() {
            confluence += 1;
        }
        let sma20 = indicators::sma(&closes, 20).last().copied();
        if let Some(sma) = sma20 {
            if (direction == Direction::Buy && last.close > sma)
                || (direction == Direction::Sell && last.close < sma)
            {
                confluence += 1;
            }
        }

        let base = match direction {
            Direction::Hold => 60.0 - (rsi - 50.0).abs(),
            _ => 50.0 + (rsi - 50.0).abs() + roc.abs().min(10.0) * 1.5,
        };

        Ok(Some(finish(
            self.id(),
            symbol,
            last,
            direction,
            base,
            confluence,
            format!("RSI {:.1}, ROC {:+.2}%", rsi, roc),
        )))
    }
}

/// Fades stretched moves: z-score of the last close against its rolling mean.
pub struct MeanReversionStrategy {
    pub lookback: usize,
    pub entry_z: f64,
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self {
            lookback: 20,
            entry_z: 2.0,
        }
    }
}

#[async_trait]
impl StrategyUnit for MeanReversionStrategy {
    fn id(&self) -> &str {
        "mean_reversion"
    }

    async fn evaluate(
        &self,
        symbol: &str,
        bars: &[Bar],
    ) -> Result<Option<StrategyOpinion>, AnalysisError> {
        require_bars(bars, self.lookback.max(15), self.id())?;
        let Some(last) = last_priced(bars) else {
            return Ok(None);
        };

        let closes = indicators::closes(bars);
        let window = &closes[closes.len() - self.lookback..];
        let z = indicators::z_score_of(last.close, window);
        if !z.is_finite() {
            return Err(AnalysisError::CalculationError("z-score is not finite".into()));
        }

        let direction = if z <= -self.entry_z {
            Direction::Buy
        } else if z >= self.entry_z {
            Direction::Sell
        } else {
            Direction::Hold
        };

        let mut confluence = 0;
        if let Some(rsi) = indicators::rsi(&closes, 14) {
            if (direction == Direction::Buy && rsi < 30.0) || (direction == Direction::Sell && rsi > 70.0) {
                confluence += 1;
            }
        }
        if let Some(avg_volume) = indicators::average_volume(bars, self.lookback) {
            if direction.is_directional() && last.volume > avg_volume * 1.5 {
                confluence += 1;
            }
        }

        let base = match direction {
            Direction::Hold => 55.0 - z.abs() * 5.0,
            _ => 55.0 + (z.abs() - self.entry_z).min(3.0) * 10.0,
        };

        Ok(Some(finish(
            self.id(),
            symbol,
            last,
            direction,
            base,
            confluence,
            format!("z-score {:+.2} over {} bars", z, self.lookback),
        )))
    }
}

/// Fast/slow moving-average crossover confirmed by the slope of the slow line.
pub struct TrendFollowingStrategy {
    pub fast: usize,
    pub slow: usize,
    pub slope_bars: usize,
}

impl Default for TrendFollowingStrategy {
    fn default() -> Self {
        Self {
            fast: 10,
            slow: 30,
            slope_bars: 5,
        }
    }
}

#[async_trait]
impl StrategyUnit for TrendFollowingStrategy {
    fn id(&self) -> &str {
        "trend_following"
    }

    async fn evaluate(
        &self,
        symbol: &str,
        bars: &[Bar],
    ) -> Result<Option<StrategyOpinion>, AnalysisError> {
        require_bars(bars, self.slow + self.slope_bars, self.id())?;
        let Some(last) = last_priced(bars) else {
            return Ok(None);
        };

        let closes = indicators::closes(bars);
        let fast = indicators::sma(&closes, self.fast);
        let slow = indicators::sma(&closes, self.slow);
        let (Some(&fast_now), Some(&slow_now)) = (fast.last(), slow.last()) else {
            return Err(AnalysisError::CalculationError("moving averages unavailable".into()));
        };
        let slow_then = slow[slow.len().saturating_sub(self.slope_bars + 1)];
        if slow_now <= 0.0 || slow_then <= 0.0 {
            return Err(AnalysisError::InvalidData("non-positive moving average".into()));
        }

        let spread_pct = (fast_now - slow_now) / slow_now * 100.0;
        let slope_pct = (slow_now - slow_then) / slow_then * 100.0;

        let direction = if spread_pct > 0.0 && slope_pct > 0.0 {
            Direction::Buy
        } else if spread_pct < 0.0 && slope_pct < 0.0 {
            Direction::Sell
        } else {
            Direction::Hold
        };

        let mut confluence = 0;
        if direction.is_directional() && spread_pct.abs() > 1.0 {
            confluence += 1;
        }
        if (direction == Direction::Buy && last.close > fast_now)
            || (direction == Direction::Sell && last.close < fast_now)
        {
            confluence += 1;
        }

        let base = match direction {
            Direction::Hold => 50.0,
            _ => 55.0 + spread_pct.abs().min(5.0) * 4.0 + slope_pct.abs().min(2.0) * 5.0,
        };

        Ok(Some(finish(
            self.id(),
            symbol,
            last,
            direction,
            base,
            confluence,
            format!("SMA{} vs SMA{} {:+.2}%, slope {:+.2}%", self.fast, self.slow, spread_pct, slope_pct),
        )))
    }
}

/// Close beyond the prior N-bar range, confirmed by volume.
pub struct BreakoutStrategy {
    pub lookback: usize,
    pub volume_factor: f64,
}

impl Default for BreakoutStrategy {
    fn default() -> Self {
        Self {
            lookback: 20,
            volume_factor: 1.5,
        }
    }
}

#[async_trait]
impl StrategyUnit for BreakoutStrategy {
    fn id(&self) -> &str {
        "breakout"
    }

    async fn evaluate(
        &self,
        symbol: &str,
        bars: &[Bar],
    ) -> Result<Option<StrategyOpinion>, AnalysisError> {
        require_bars(bars, self.lookback + 1, self.id())?;
        let Some(last) = last_priced(bars) else {
            return Ok(None);
        };

        let prior = &bars[bars.len() - 1 - self.lookback..bars.len() - 1];
        let range_high = prior.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let range_low = prior.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        if !(range_high.is_finite() && range_low.is_finite()) || range_high <= range_low {
            return Ok(None);
        }

        let direction = if last.close > range_high {
            Direction::Buy
        } else if last.close < range_low {
            Direction::Sell
        } else {
            Direction::Hold
        };

        let avg_volume = indicators::mean(&prior.iter().map(|b| b.volume).collect::<Vec<_>>());
        let mut confluence = 0;
        if direction.is_directional() && avg_volume > 0.0 && last.volume >= avg_volume * self.volume_factor {
            confluence += 1;
        }
        // Closing near the extreme of its own bar
        let bar_range = last.high - last.low;
        if bar_range > 0.0 {
            let position_in_bar = (last.close - last.low) / bar_range;
            if (direction == Direction::Buy && position_in_bar > 0.75)
                || (direction == Direction::Sell && position_in_bar < 0.25)
            {
                confluence += 1;
            }
        }

        let width = range_high - range_low;
        let base = match direction {
            Direction::Buy => 60.0 + ((last.close - range_high) / width * 50.0).min(20.0),
            Direction::Sell => 60.0 + ((range_low - last.close) / width * 50.0).min(20.0),
            Direction::Hold => 45.0,
        };

        Ok(Some(finish(
            self.id(),
            symbol,
            last,
            direction,
            base,
            confluence,
            format!("close {:.4} vs range {:.4}-{:.4}", last.close, range_low, range_high),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars_from(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: start + Duration::hours(i as i64),
                open: c,
                high: c * 1.002,
                low: c * 0.998,
                close: c,
                volume: 1_000.0,
                vwap: None,
            })
            .collect()
    }

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    fn falling(n: usize) -> Vec<f64> {
        (0..n).map(|i| 200.0 - i as f64).collect()
    }

    #[tokio::test]
    async fn test_momentum_follows_direction() {
        let up = MomentumStrategy::default()
            .evaluate("X", &bars_from(&rising(40)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(up.direction, Direction::Buy);
        assert!(up.confluence >= 2);
        assert!(up.confidence <= MAX_CONFIDENCE);

        let down = MomentumStrategy::default()
            .evaluate("X", &bars_from(&falling(40)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(down.direction, Direction::Sell);
    }

    #[tokio::test]
    async fn test_insufficient_data_is_an_error() {
        let err = MomentumStrategy::default()
            .evaluate("X", &bars_from(&rising(5)))
            .await
            .unwrap_err();
        assert!(err.is_data_error());
    }

    #[tokio::test]
    async fn test_unpriced_last_bar_abstains() {
        let mut closes = rising(40);
        *closes.last_mut().unwrap() = 0.0;
        let out = BreakoutStrategy::default()
            .evaluate("X", &bars_from(&closes))
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_mean_reversion_fades_spike() {
        let mut closes: Vec<f64> = (0..30).map(|i| 100.0 + if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        closes.push(90.0);
        let opinion = MeanReversionStrategy::default()
            .evaluate("X", &bars_from(&closes))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opinion.direction, Direction::Buy);

        let flat = vec![100.0; 30];
        let opinion = MeanReversionStrategy::default()
            .evaluate("X", &bars_from(&flat))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opinion.direction, Direction::Hold);
    }

    #[tokio::test]
    async fn test_trend_following() {
        let opinion = TrendFollowingStrategy::default()
            .evaluate("X", &bars_from(&rising(60)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opinion.direction, Direction::Buy);

        let opinion = TrendFollowingStrategy::default()
            .evaluate("X", &bars_from(&falling(60)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opinion.direction, Direction::Sell);
    }

    #[tokio::test]
    async fn test_breakout_with_volume() {
        let mut closes = vec![100.0; 25];
        closes.push(110.0);
        let mut bars = bars_from(&closes);
        if let Some(last) = bars.last_mut() {
            last.volume = 5_000.0;
            last.high = 110.1;
            last.low = 105.0;
        }
        let opinion = BreakoutStrategy::default().evaluate("X", &bars).await.unwrap().unwrap();
        assert_eq!(opinion.direction, Direction::Buy);
        assert_eq!(opinion.confluence, 2);
        assert_eq!(opinion.price, 110.0);
    }
}
