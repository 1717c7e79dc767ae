use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV bar data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub vwap: Option<f64>,
}

/// Last traded price as reported by the market-data collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl PriceQuote {
    pub fn new(price: f64, timestamp: DateTime<Utc>) -> Self {
        Self { price, timestamp }
    }
}

/// Directional view of a single strategy or of the consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
            Direction::Hold => "HOLD",
        }
    }

    pub fn is_directional(&self) -> bool {
        !matches!(self, Direction::Hold)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side of an actual position. Unlike [`Direction`] there is no HOLD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// +1 for long exposure, -1 for short exposure.
    pub fn sign(&self) -> f64 {
        match self {
            TradeSide::Buy => 1.0,
            TradeSide::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<Direction> for TradeSide {
    type Error = Direction;

    fn try_from(direction: Direction) -> Result<Self, Self::Error> {
        match direction {
            Direction::Buy => Ok(TradeSide::Buy),
            Direction::Sell => Ok(TradeSide::Sell),
            Direction::Hold => Err(Direction::Hold),
        }
    }
}

impl From<TradeSide> for Direction {
    fn from(side: TradeSide) -> Self {
        match side {
            TradeSide::Buy => Direction::Buy,
            TradeSide::Sell => Direction::Sell,
        }
    }
}

/// A scored directional opinion produced by one strategy unit for one symbol.
///
/// Opinions live for a single analysis tick and are discarded once the
/// consensus has been computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyOpinion {
    pub strategy_id: String,
    pub symbol: String,
    pub direction: Direction,
    /// 0 to 100
    pub confidence: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub weight: f64,
    /// Number of independent confirmations behind this opinion.
    #[serde(default)]
    pub confluence: u32,
    #[serde(default)]
    pub reason: String,
}

impl StrategyOpinion {
    pub fn new(
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        direction: Direction,
        confidence: f64,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            direction,
            confidence,
            price,
            timestamp,
            weight: 1.0,
            confluence: 0,
            reason: String::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_confluence(mut self, confluence: u32) -> Self {
        self.confluence = confluence;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// An opinion can only be tallied when its numbers are usable.
    pub fn is_valid(&self) -> bool {
        self.confidence.is_finite()
            && self.price.is_finite()
            && self.price > 0.0
            && self.weight.is_finite()
            && self.weight > 0.0
    }
}

/// Seven-level consensus decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusDecision {
    StrongBuy,
    Buy,
    WeakBuy,
    Hold,
    WeakSell,
    Sell,
    StrongSell,
}

impl ConsensusDecision {
    /// Convert to numeric score (-100 to 100)
    pub fn to_score(&self) -> i32 {
        match self {
            ConsensusDecision::StrongBuy => 100,
            ConsensusDecision::Buy => 60,
            ConsensusDecision::WeakBuy => 30,
            ConsensusDecision::Hold => 0,
            ConsensusDecision::WeakSell => -30,
            ConsensusDecision::Sell => -60,
            ConsensusDecision::StrongSell => -100,
        }
    }

    /// Tier a direction by strength score: >=90 strong, >=80 plain, >=70 weak,
    /// anything else holds.
    pub fn from_strength(direction: Direction, strength: f64) -> Self {
        let tier = if strength >= 90.0 {
            3
        } else if strength >= 80.0 {
            2
        } else if strength >= 70.0 {
            1
        } else {
            0
        };

        match (direction, tier) {
            (_, 0) | (Direction::Hold, _) => ConsensusDecision::Hold,
            (Direction::Buy, 3) => ConsensusDecision::StrongBuy,
            (Direction::Buy, 2) => ConsensusDecision::Buy,
            (Direction::Buy, _) => ConsensusDecision::WeakBuy,
            (Direction::Sell, 3) => ConsensusDecision::StrongSell,
            (Direction::Sell, 2) => ConsensusDecision::Sell,
            (Direction::Sell, _) => ConsensusDecision::WeakSell,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            ConsensusDecision::StrongBuy | ConsensusDecision::Buy | ConsensusDecision::WeakBuy => {
                Direction::Buy
            }
            ConsensusDecision::StrongSell
            | ConsensusDecision::Sell
            | ConsensusDecision::WeakSell => Direction::Sell,
            ConsensusDecision::Hold => Direction::Hold,
        }
    }

    pub fn is_directional(&self) -> bool {
        self.direction().is_directional()
    }

    /// Human-readable label for the decision
    pub fn to_label(&self) -> &'static str {
        match self {
            ConsensusDecision::StrongBuy => "Strong Buy",
            ConsensusDecision::Buy => "Buy",
            ConsensusDecision::WeakBuy => "Weak Buy",
            ConsensusDecision::Hold => "Hold",
            ConsensusDecision::WeakSell => "Weak Sell",
            ConsensusDecision::Sell => "Sell",
            ConsensusDecision::StrongSell => "Strong Sell",
        }
    }
}

/// Timeframe for analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    Minute1,
    Minute5,
    Minute15,
    Minute30,
    Hour1,
    Hour4,
    Day1,
}

impl Timeframe {
    pub fn to_minutes(&self) -> i64 {
        match self {
            Timeframe::Minute1 => 1,
            Timeframe::Minute5 => 5,
            Timeframe::Minute15 => 15,
            Timeframe::Minute30 => 30,
            Timeframe::Hour1 => 60,
            Timeframe::Hour4 => 240,
            Timeframe::Day1 => 1440,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1m" | "1min" => Some(Timeframe::Minute1),
            "5m" | "5min" => Some(Timeframe::Minute5),
            "15m" | "15min" => Some(Timeframe::Minute15),
            "30m" | "30min" => Some(Timeframe::Minute30),
            "1h" | "1hour" => Some(Timeframe::Hour1),
            "4h" | "4hour" => Some(Timeframe::Hour4),
            "1d" | "daily" | "day" => Some(Timeframe::Day1),
            _ => None,
        }
    }
}
