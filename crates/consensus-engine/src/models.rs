use analysis_core::{ConsensusDecision, Direction, StrategyOpinion};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Thresholds and scoring constants for the consensus vote.
///
/// Percentages and confidences are on a 0-100 scale, `max_contradiction` is a
/// ratio in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Fewer valid opinions than this yields HOLD / insufficient_inputs.
    pub min_opinions: usize,
    /// Share of votes the dominant direction needs for a BUY/SELL decision.
    /// The default of 66 lets two of three votes through: [BUY, BUY, HOLD]
    /// scores 66.67% and sits just above it, so a 67% threshold would hold.
    pub min_consensus: f64,
    /// Relaxed consensus threshold when the dominant class is HOLD.
    pub hold_min_consensus: f64,
    pub min_confidence: f64,
    pub hold_min_confidence: f64,
    pub min_coherence: f64,
    /// Highest tolerated min(buy, sell) / total.
    pub max_contradiction: f64,
    pub unanimity_bonus: f64,
    pub contradiction_penalty: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_opinions: 2,
            min_consensus: 66.0,
            hold_min_consensus: 50.0,
            min_confidence: 60.0,
            hold_min_confidence: 40.0,
            min_coherence: 50.0,
            max_contradiction: 0.25,
            unanimity_bonus: 20.0,
            contradiction_penalty: 50.0,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<()> {
        let pct_fields = [
            ("min_consensus", self.min_consensus),
            ("hold_min_consensus", self.hold_min_consensus),
            ("min_confidence", self.min_confidence),
            ("hold_min_confidence", self.hold_min_confidence),
            ("min_coherence", self.min_coherence),
        ];
        for (name, value) in pct_fields {
            if !(0.0..=100.0).contains(&value) {
                bail!("{} must be between 0 and 100 (got {})", name, value);
            }
        }
        if !(0.0..=1.0).contains(&self.max_contradiction) {
            bail!("max_contradiction must be between 0 and 1");
        }
        if self.min_opinions < 2 {
            bail!("min_opinions must be at least 2");
        }
        if self.unanimity_bonus < 0.0 || self.contradiction_penalty < 0.0 {
            bail!("unanimity_bonus and contradiction_penalty must be non-negative");
        }
        Ok(())
    }
}

/// Risk band derived from how much the strategies disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusRiskLevel {
    Low,
    Medium,
    High,
}

/// Why a result was forced to (or stayed at) HOLD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusFlag {
    InsufficientInputs,
    BelowConsensus,
    BelowConfidence,
    LowCoherence,
    ContradictionExceeded,
    HighRisk,
    WeakStrength,
    /// Scoring produced a non-finite value; safe defaults were substituted.
    Degraded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionCounts {
    pub buy: usize,
    pub sell: usize,
    pub hold: usize,
}

impl DirectionCounts {
    pub fn total(&self) -> usize {
        self.buy + self.sell + self.hold
    }

    pub fn get(&self, direction: Direction) -> usize {
        match direction {
            Direction::Buy => self.buy,
            Direction::Sell => self.sell,
            Direction::Hold => self.hold,
        }
    }
}

/// One merged decision for one symbol and one analysis tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub symbol: String,
    pub decision: ConsensusDecision,
    /// Direction of the final decision (HOLD when gated).
    pub direction: Direction,
    /// Majority class before quality gates were applied.
    pub dominant: Direction,
    pub weighted_confidence: f64,
    pub consensus_percentage: f64,
    pub coherence_score: f64,
    pub quality_score: f64,
    pub strength_score: f64,
    pub contradiction_ratio: f64,
    pub counts: DirectionCounts,
    pub risk_level: ConsensusRiskLevel,
    pub flags: Vec<ConsensusFlag>,
    /// Weight-averaged price of the opinions backing the dominant direction.
    pub reference_price: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub opinions: Vec<StrategyOpinion>,
}

impl ConsensusResult {
    pub fn is_actionable(&self) -> bool {
        self.decision.is_directional()
    }

    pub fn has_flag(&self, flag: ConsensusFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn insufficient_inputs(&self) -> bool {
        self.has_flag(ConsensusFlag::InsufficientInputs)
    }
}
