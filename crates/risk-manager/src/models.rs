use analysis_core::{Bar, TradeSide};
use consensus_engine::ConsensusResult;
use market_regime_detector::MarketRegime;
use serde::{Deserialize, Serialize};

use crate::error::RiskError;

/// Fixed weights of the six risk factors. Must sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactorWeights {
    pub confidence: f64,
    pub volatility: f64,
    pub drawdown: f64,
    pub liquidity: f64,
    pub correlation: f64,
    pub regime: f64,
}

impl Default for RiskFactorWeights {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            volatility: 0.20,
            drawdown: 0.20,
            liquidity: 0.10,
            correlation: 0.10,
            regime: 0.15,
        }
    }
}

impl RiskFactorWeights {
    pub fn sum(&self) -> f64 {
        self.confidence
            + self.volatility
            + self.drawdown
            + self.liquidity
            + self.correlation
            + self.regime
    }

    fn as_array(&self) -> [f64; 6] {
        [
            self.confidence,
            self.volatility,
            self.drawdown,
            self.liquidity,
            self.correlation,
            self.regime,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Share of portfolio value put at risk per trade, in percent
    pub risk_per_trade_percent: f64,
    /// Hard cap on one position's notional as a fraction of portfolio value
    pub max_position_fraction: f64,
    /// Smallest notional worth opening
    pub min_position_notional: f64,
    /// Drawdown (percent from peak) at which new entries are refused
    pub max_drawdown_percent: f64,
    /// Minimum consensus confidence (0-100)
    pub min_confidence: f64,
    pub reward_risk_ratio: f64,
    pub atr_period: usize,
    /// Stop distance in percent when ATR cannot be computed
    pub fallback_stop_percent: f64,
    /// Daily volatility budget per position, in percent of portfolio
    pub target_volatility_percent: f64,
    /// ATR% that maps to a volatility risk of 100
    pub reference_atr_percent: f64,
    /// Average volume below which liquidity risk is maximal
    pub min_avg_volume: f64,
    /// Used to scale correlation risk
    pub max_open_positions: usize,
    pub kelly_multiplier: f64,
    pub max_kelly_fraction: f64,
    /// Minimum bars before regime detection is attempted
    pub regime_min_bars: usize,
    pub factor_weights: RiskFactorWeights,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_percent: 1.0,
            max_position_fraction: 0.10,
            min_position_notional: 10.0,
            max_drawdown_percent: 15.0,
            min_confidence: 55.0,
            reward_risk_ratio: 2.0,
            atr_period: 14,
            fallback_stop_percent: 2.0,
            target_volatility_percent: 0.5,
            reference_atr_percent: 5.0,
            min_avg_volume: 100.0,
            max_open_positions: 5,
            kelly_multiplier: 0.5,
            max_kelly_fraction: 0.25,
            regime_min_bars: 30,
            factor_weights: RiskFactorWeights::default(),
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), RiskError> {
        let check = |ok: bool, msg: &str| {
            if ok {
                Ok(())
            } else {
                Err(RiskError::Config(msg.to_string()))
            }
        };

        check(
            self.risk_per_trade_percent > 0.0 && self.risk_per_trade_percent <= 100.0,
            "risk_per_trade_percent must be in (0, 100]",
        )?;
        check(
            self.max_position_fraction > 0.0 && self.max_position_fraction <= 1.0,
            "max_position_fraction must be in (0, 1]",
        )?;
        check(self.min_position_notional >= 0.0, "min_position_notional must be >= 0")?;
        check(
            self.max_drawdown_percent > 0.0 && self.max_drawdown_percent <= 100.0,
            "max_drawdown_percent must be in (0, 100]",
        )?;
        check(
            (0.0..=100.0).contains(&self.min_confidence),
            "min_confidence must be in [0, 100]",
        )?;
        check(self.reward_risk_ratio > 0.0, "reward_risk_ratio must be positive")?;
        check(self.atr_period > 0, "atr_period must be positive")?;
        check(
            self.fallback_stop_percent > 0.0 && self.fallback_stop_percent < 100.0,
            "fallback_stop_percent must be in (0, 100)",
        )?;
        check(self.target_volatility_percent > 0.0, "target_volatility_percent must be positive")?;
        check(self.reference_atr_percent > 0.0, "reference_atr_percent must be positive")?;
        check(self.max_open_positions > 0, "max_open_positions must be positive")?;
        check(
            self.kelly_multiplier > 0.0 && self.kelly_multiplier <= 1.0,
            "kelly_multiplier must be in (0, 1]",
        )?;
        check(
            self.max_kelly_fraction > 0.0 && self.max_kelly_fraction <= 1.0,
            "max_kelly_fraction must be in (0, 1]",
        )?;
        check(
            self.factor_weights.as_array().iter().all(|w| *w >= 0.0),
            "factor weights must be non-negative",
        )?;
        check(
            (self.factor_weights.sum() - 1.0).abs() < 1e-6,
            "factor weights must sum to 1",
        )?;
        Ok(())
    }
}

/// What the assessor is asked to approve.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeProposal {
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: f64,
    /// Consensus confidence, 0-100
    pub confidence: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Recent bars used for ATR, liquidity and regime.
    pub bars: Vec<Bar>,
}

impl TradeProposal {
    /// Build a proposal from a directional consensus. `None` for HOLD.
    pub fn from_consensus(result: &ConsensusResult, entry_price: f64, bars: Vec<Bar>) -> Option<Self> {
        let side = TradeSide::try_from(result.direction).ok()?;
        Some(Self {
            symbol: result.symbol.clone(),
            side,
            entry_price,
            confidence: result.weighted_confidence,
            stop_loss: None,
            take_profit: None,
            bars,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    VeryLow,
    Low,
    Moderate,
    High,
    VeryHigh,
    Extreme,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 20.0 {
            RiskLevel::VeryLow
        } else if score < 40.0 {
            RiskLevel::Low
        } else if score < 60.0 {
            RiskLevel::Moderate
        } else if score < 75.0 {
            RiskLevel::High
        } else if score < 90.0 {
            RiskLevel::VeryHigh
        } else {
            RiskLevel::Extreme
        }
    }

    pub fn blocks_entry(&self) -> bool {
        *self >= RiskLevel::VeryHigh
    }
}

/// Per-factor breakdown, each in [0, 100].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskFactors {
    pub confidence_risk: f64,
    pub volatility_risk: f64,
    pub drawdown_risk: f64,
    pub liquidity_risk: f64,
    pub correlation_risk: f64,
    pub regime_risk: f64,
}

impl RiskFactors {
    pub fn weighted(&self, weights: &RiskFactorWeights) -> f64 {
        self.confidence_risk * weights.confidence
            + self.volatility_risk * weights.volatility
            + self.drawdown_risk * weights.drawdown
            + self.liquidity_risk * weights.liquidity
            + self.correlation_risk * weights.correlation
            + self.regime_risk * weights.regime
    }
}

/// Candidate quantities considered by the sizer, before clamping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizingBreakdown {
    pub fixed_fractional: f64,
    pub kelly: f64,
    pub volatility_adjusted: f64,
    pub min_quantity: f64,
    pub max_quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub symbol: String,
    pub side: TradeSide,
    pub approved: bool,
    pub overall_risk_score: f64,
    pub risk_level: RiskLevel,
    pub factors: RiskFactors,
    pub regime: MarketRegime,
    /// Quantity of the base asset
    pub recommended_size: f64,
    pub recommended_notional: f64,
    pub entry_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub risk_reward_ratio: f64,
    /// |entry − stop| / entry
    pub trailing_distance: f64,
    pub sizing: SizingBreakdown,
    pub rejection_reasons: Vec<String>,
    /// True when this is the conservative stand-in for a failed assessment.
    pub fallback: bool,
}
