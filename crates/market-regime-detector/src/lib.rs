use analysis_core::{indicators, Bar, Direction};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

/// Market regime classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketRegime {
    /// Strong upward trend with low volatility
    TrendingBullish,

    /// Strong downward trend with low volatility
    TrendingBearish,

    /// Sideways movement with clear support/resistance
    Ranging,

    /// High volatility with rapid price swings
    Volatile,

    /// Low volatility, tight price range
    Calm,

    /// Unable to classify (insufficient data)
    Unknown,
}

impl MarketRegime {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            MarketRegime::TrendingBullish => "Trending Bullish",
            MarketRegime::TrendingBearish => "Trending Bearish",
            MarketRegime::Ranging => "Ranging",
            MarketRegime::Volatile => "Volatile",
            MarketRegime::Calm => "Calm",
            MarketRegime::Unknown => "Unknown",
        }
    }

    /// Get risk multiplier for this regime (1.0 = normal risk)
    pub fn risk_multiplier(&self) -> f64 {
        match self {
            MarketRegime::TrendingBullish | MarketRegime::TrendingBearish => 1.2,
            MarketRegime::Ranging => 1.0,
            MarketRegime::Volatile => 0.5,
            MarketRegime::Calm => 1.1,
            MarketRegime::Unknown => 0.3,
        }
    }

    /// ATR multiple used to place a stop when none was supplied.
    /// Tight in quiet/ranging markets, wide when volatile.
    pub fn atr_stop_multiplier(&self) -> f64 {
        match self {
            MarketRegime::Ranging | MarketRegime::Calm => 1.5,
            MarketRegime::Volatile => 3.0,
            MarketRegime::TrendingBullish
            | MarketRegime::TrendingBearish
            | MarketRegime::Unknown => 2.0,
        }
    }

    /// Direction of the trend, if the regime is a trending one.
    pub fn trend_direction(&self) -> Option<Direction> {
        match self {
            MarketRegime::TrendingBullish => Some(Direction::Buy),
            MarketRegime::TrendingBearish => Some(Direction::Sell),
            _ => None,
        }
    }
}

/// Regime detection result with confidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeDetectionResult {
    pub regime: MarketRegime,
    pub confidence: f64,
    pub metrics: RegimeMetrics,
    pub detected_at: DateTime<Utc>,
    pub reasoning: String,
}

/// Market regime metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeMetrics {
    /// Average True Range (ATR) as percentage
    pub atr_percent: f64,

    /// Trend strength (negative = bearish, positive = bullish)
    pub trend_strength: f64,

    /// Volatility (standard deviation of returns)
    pub volatility: f64,

    /// Range efficiency (directional movement / total movement)
    pub range_efficiency: f64,

    /// Number of bars analyzed
    pub sample_size: usize,
}

/// Rule-based market regime detector
#[derive(Debug, Clone)]
pub struct MarketRegimeDetector {
    /// Minimum bars required for analysis
    min_bars: usize,
}

impl MarketRegimeDetector {
    pub fn new() -> Self {
        Self { min_bars: 50 }
    }

    pub fn with_min_bars(min_bars: usize) -> Self {
        Self {
            min_bars: min_bars.max(21),
        }
    }

    /// Classify the series. Never fails: short or degenerate input yields
    /// `MarketRegime::Unknown` with zero confidence.
    pub fn detect_regime(&self, bars: &[Bar]) -> RegimeDetectionResult {
        let detected_at = bars.last().map(|b| b.timestamp).unwrap_or_else(Utc::now);

        if bars.len() < self.min_bars {
            debug!("Regime unknown: {} bars (need {})", bars.len(), self.min_bars);
            return RegimeDetectionResult {
                regime: MarketRegime::Unknown,
                confidence: 0.0,
                metrics: RegimeMetrics {
                    sample_size: bars.len(),
                    ..RegimeMetrics::default()
                },
                detected_at,
                reasoning: format!("Insufficient data: {} bars (need {})", bars.len(), self.min_bars),
            };
        }

        let metrics = self.calculate_metrics(bars);
        let (regime, confidence, reasoning) = self.classify_regime(&metrics);

        RegimeDetectionResult {
            regime,
            confidence,
            metrics,
            detected_at,
            reasoning,
        }
    }

    fn calculate_metrics(&self, bars: &[Bar]) -> RegimeMetrics {
        RegimeMetrics {
            atr_percent: self.calculate_atr_percent(bars),
            trend_strength: self.calculate_trend_strength(bars),
            volatility: self.calculate_volatility(bars),
            range_efficiency: self.calculate_range_efficiency(bars),
            sample_size: bars.len(),
        }
    }

    /// Average True Range as percentage of the last close
    fn calculate_atr_percent(&self, bars: &[Bar]) -> f64 {
        let last_close = bars.last().map(|b| b.close).unwrap_or(0.0);
        match indicators::atr(bars, 14) {
            Some(atr) if last_close > 0.0 => atr / last_close * 100.0,
            _ => 0.0,
        }
    }

    /// Slope of a least-squares line over the last 20 closes, normalised by
    /// the average price.
    fn calculate_trend_strength(&self, bars: &[Bar]) -> f64 {
        const WINDOW: usize = 20;
        if bars.len() < WINDOW {
            return 0.0;
        }

        let recent_bars = &bars[bars.len() - WINDOW..];
        let n = WINDOW as f64;

        let sum_x: f64 = (0..WINDOW).sum::<usize>() as f64;
        let sum_y: f64 = recent_bars.iter().map(|b| b.close).sum();
        let sum_xy: f64 = recent_bars
            .iter()
            .enumerate()
            .map(|(i, b)| i as f64 * b.close)
            .sum();
        let sum_x2: f64 = (0..WINDOW).map(|i| (i * i) as f64).sum();

        let slope = (n * sum_xy - sum_x * sum_y) / (n * sum_x2 - sum_x * sum_x);
        let avg_price = sum_y / n;
        if avg_price <= 0.0 {
            return 0.0;
        }

        slope / avg_price
    }

    /// Population standard deviation of close-to-close returns
    fn calculate_volatility(&self, bars: &[Bar]) -> f64 {
        let returns: Vec<f64> = bars
            .windows(2)
            .filter(|w| w[0].close > 0.0)
            .map(|w| (w[1].close - w[0].close) / w[0].close)
            .collect();
        if returns.is_empty() {
            return 0.0;
        }

        let mean = indicators::mean(&returns);
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;

        variance.sqrt()
    }

    /// How efficiently price moves: net movement over total path length
    fn calculate_range_efficiency(&self, bars: &[Bar]) -> f64 {
        let (first, last) = match (bars.first(), bars.last()) {
            (Some(first), Some(last)) => (first.close, last.close),
            _ => return 0.0,
        };
        let net_movement = (last - first).abs();

        let total_movement: f64 = bars
            .windows(2)
            .map(|w| (w[1].close - w[0].close).abs())
            .sum();

        if total_movement == 0.0 {
            return 0.0;
        }

        net_movement / total_movement
    }

    fn classify_regime(&self, metrics: &RegimeMetrics) -> (MarketRegime, f64, String) {
        let mut scores = [
            (MarketRegime::TrendingBullish, 0.0_f64),
            (MarketRegime::TrendingBearish, 0.0_f64),
            (MarketRegime::Ranging, 0.0_f64),
            (MarketRegime::Volatile, 0.0_f64),
            (MarketRegime::Calm, 0.0_f64),
        ];

        if metrics.volatility > 0.03 {
            scores[3].1 += 40.0;
        }

        if metrics.volatility < 0.01 {
            scores[4].1 += 30.0;
        }

        // Strong uptrend
        if metrics.trend_strength > 0.001 && metrics.range_efficiency > 0.5 {
            scores[0].1 += 50.0;
        }

        // Strong downtrend
        if metrics.trend_strength < -0.001 && metrics.range_efficiency > 0.5 {
            scores[1].1 += 50.0;
        }

        // Ranging (low efficiency, moderate volatility)
        if metrics.range_efficiency < 0.3 && metrics.volatility < 0.025 {
            scores[2].1 += 40.0;
        }

        if metrics.atr_percent > 3.0 {
            scores[3].1 += 20.0;
        } else if metrics.atr_percent < 1.0 {
            scores[4].1 += 20.0;
        }

        // Stable sort keeps declaration order on ties
        scores.sort_by(|a, b| b.1.total_cmp(&a.1));
        let (regime, score) = scores[0];
        if score <= 0.0 {
            return (
                MarketRegime::Unknown,
                0.0,
                "No regime rule matched".to_string(),
            );
        }

        let confidence = f64::min(score / 100.0, 1.0);

        let reasoning = format!(
            "{} (trend: {:.4}, volatility: {:.2}%, efficiency: {:.2}, ATR: {:.2}%)",
            regime.name(),
            metrics.trend_strength,
            metrics.volatility * 100.0,
            metrics.range_efficiency,
            metrics.atr_percent
        );

        (regime, confidence, reasoning)
    }
}

impl Default for MarketRegimeDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn create_test_bars(count: usize, trend: f64) -> Vec<Bar> {
        let start = Utc::now();
        (0..count)
            .map(|i| {
                let base_price = 100.0 + (i as f64 * trend);
                Bar {
                    timestamp: start + Duration::minutes(i as i64),
                    open: base_price,
                    high: base_price + 1.0,
                    low: base_price - 1.0,
                    close: base_price,
                    volume: 1000.0,
                    vwap: None,
                }
            })
            .collect()
    }

    fn create_choppy_bars(count: usize, swing: f64) -> Vec<Bar> {
        let start = Utc::now();
        (0..count)
            .map(|i| {
                let close = if i % 2 == 0 { 100.0 + swing } else { 100.0 - swing };
                Bar {
                    timestamp: start + Duration::minutes(i as i64),
                    open: 100.0,
                    high: close.max(100.0) + 0.5,
                    low: close.min(100.0) - 0.5,
                    close,
                    volume: 1000.0,
                    vwap: None,
                }
            })
            .collect()
    }

    #[test]
    fn test_uptrend_detection() {
        let detector = MarketRegimeDetector::new();
        let bars = create_test_bars(100, 0.5);

        let result = detector.detect_regime(&bars);

        assert_eq!(result.regime, MarketRegime::TrendingBullish);
        assert!(result.metrics.trend_strength > 0.0);
        assert_eq!(result.regime.trend_direction(), Some(Direction::Buy));
    }

    #[test]
    fn test_downtrend_detection() {
        let detector = MarketRegimeDetector::new();
        let bars = create_test_bars(100, -0.5);

        let result = detector.detect_regime(&bars);

        assert_eq!(result.regime, MarketRegime::TrendingBearish);
        assert!(result.metrics.trend_strength < 0.0);
    }

    #[test]
    fn test_volatile_detection() {
        let detector = MarketRegimeDetector::new();
        // +-6% swings every bar
        let bars = create_choppy_bars(100, 6.0);

        let result = detector.detect_regime(&bars);

        assert_eq!(result.regime, MarketRegime::Volatile);
        assert_eq!(result.regime.atr_stop_multiplier(), 3.0);
    }

    #[test]
    fn test_insufficient_data() {
        let detector = MarketRegimeDetector::new();
        let bars = create_test_bars(10, 0.0);

        let result = detector.detect_regime(&bars);

        assert_eq!(result.regime, MarketRegime::Unknown);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.metrics.sample_size, 10);
    }

    #[test]
    fn test_stop_multipliers() {
        assert_eq!(MarketRegime::Ranging.atr_stop_multiplier(), 1.5);
        assert_eq!(MarketRegime::TrendingBullish.atr_stop_multiplier(), 2.0);
        assert_eq!(MarketRegime::Unknown.atr_stop_multiplier(), 2.0);
        assert_eq!(MarketRegime::Volatile.atr_stop_multiplier(), 3.0);
    }
}
