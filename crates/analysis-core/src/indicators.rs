/// Minimal indicator helpers shared by the strategy units and the risk
/// assessor. Every function degrades to an empty/`None` result on short
/// input instead of panicking; callers decide whether that means "abstain".
use crate::Bar;

/// Compute the mean of a data slice.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Compute sample standard deviation.
pub fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    let variance = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

/// Compute the z-score of `value` relative to `data`.
/// Returns 0.0 if data has insufficient variance.
pub fn z_score_of(value: f64, data: &[f64]) -> f64 {
    let sd = std_dev(data);
    if sd < f64::EPSILON {
        return 0.0;
    }
    (value - mean(data)) / sd
}

pub fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Simple Moving Average
pub fn sma(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }

    let mut result = Vec::with_capacity(data.len() - period + 1);
    for i in period - 1..data.len() {
        let sum: f64 = data[i + 1 - period..=i].iter().sum();
        result.push(sum / period as f64);
    }
    result
}

/// Relative Strength Index (Wilder smoothing). Latest value only.
pub fn rsi(data: &[f64], period: usize) -> Option<f64> {
    if period == 0 || data.len() < period + 1 {
        return None;
    }

    let changes: Vec<f64> = data.windows(2).map(|w| w[1] - w[0]).collect();
    let gain = |c: &f64| c.max(0.0);
    let loss = |c: &f64| (-c).max(0.0);

    let mut avg_gain = changes[..period].iter().map(gain).sum::<f64>() / period as f64;
    let mut avg_loss = changes[..period].iter().map(loss).sum::<f64>() / period as f64;

    for change in &changes[period..] {
        avg_gain = (avg_gain * (period - 1) as f64 + gain(change)) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + loss(change)) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

/// Average True Range (Wilder smoothing). Latest value only.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let true_ranges: Vec<f64> = bars
        .windows(2)
        .map(|w| {
            let high_low = w[1].high - w[1].low;
            let high_close = (w[1].high - w[0].close).abs();
            let low_close = (w[1].low - w[0].close).abs();
            high_low.max(high_close).max(low_close)
        })
        .collect();

    let mut atr = true_ranges[..period].iter().sum::<f64>() / period as f64;
    for tr in &true_ranges[period..] {
        atr = (atr * (period - 1) as f64 + tr) / period as f64;
    }

    atr.is_finite().then_some(atr)
}

/// Percentage change between the close `lookback` bars ago and the last close.
pub fn rate_of_change(data: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || data.len() <= lookback {
        return None;
    }
    let past = data[data.len() - 1 - lookback];
    let last = *data.last()?;
    if past == 0.0 {
        return None;
    }
    Some((last - past) / past * 100.0)
}

/// Standard deviation of simple close-to-close returns.
pub fn returns_volatility(bars: &[Bar]) -> f64 {
    let returns: Vec<f64> = bars
        .windows(2)
        .filter(|w| w[0].close > 0.0)
        .map(|w| (w[1].close - w[0].close) / w[0].close)
        .collect();
    std_dev(&returns)
}

pub fn average_volume(bars: &[Bar], lookback: usize) -> Option<f64> {
    if bars.is_empty() || lookback == 0 {
        return None;
    }
    let start = bars.len().saturating_sub(lookback);
    let volumes: Vec<f64> = bars[start..].iter().map(|b| b.volume).collect();
    Some(mean(&volumes))
}
