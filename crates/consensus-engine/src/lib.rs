use analysis_core::{ConsensusDecision, Direction, StrategyOpinion};
use chrono::{DateTime, Utc};

pub mod models;
pub mod stats;

pub use models::{
    ConsensusConfig, ConsensusFlag, ConsensusResult, ConsensusRiskLevel, DirectionCounts,
};
pub use stats::ConsensusStats;

/// Ratio above which two opposing camps make the vote itself risky.
const HIGH_RISK_CONTRADICTION: f64 = 0.3;
/// Points deducted from quality per failed gate.
const GATE_QUALITY_PENALTY: f64 = 10.0;
/// Confidence substituted when scoring degenerates.
const DEGRADED_CONFIDENCE: f64 = 50.0;

fn clamp_score(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// Running totals for one vote. Built from valid opinions only.
#[derive(Debug, Default)]
struct Tally {
    counts: DirectionCounts,
    buy_weight: f64,
    sell_weight: f64,
    hold_weight: f64,
    weighted_confidence_sum: f64,
}

impl Tally {
    fn from_opinions(opinions: &[StrategyOpinion]) -> Self {
        let mut tally = Tally::default();
        for op in opinions {
            match op.direction {
                Direction::Buy => {
                    tally.counts.buy += 1;
                    tally.buy_weight += op.weight;
                }
                Direction::Sell => {
                    tally.counts.sell += 1;
                    tally.sell_weight += op.weight;
                }
                Direction::Hold => {
                    tally.counts.hold += 1;
                    tally.hold_weight += op.weight;
                }
            }
            tally.weighted_confidence_sum += op.confidence * op.weight;
        }
        tally
    }

    fn weight(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Buy => self.buy_weight,
            Direction::Sell => self.sell_weight,
            Direction::Hold => self.hold_weight,
        }
    }

    fn total_weight(&self) -> f64 {
        self.buy_weight + self.sell_weight + self.hold_weight
    }

    /// Majority class. Equal counts fall back to the heavier cumulative
    /// weight, and exact weight ties resolve HOLD > BUY > SELL.
    fn dominant(&self) -> Direction {
        [Direction::Buy, Direction::Sell, Direction::Hold]
            .into_iter()
            .max_by(|a, b| {
                self.counts
                    .get(*a)
                    .cmp(&self.counts.get(*b))
                    .then_with(|| self.weight(*a).total_cmp(&self.weight(*b)))
                    .then_with(|| tie_rank(*a).cmp(&tie_rank(*b)))
            })
            .unwrap_or(Direction::Hold)
    }
}

fn tie_rank(direction: Direction) -> u8 {
    match direction {
        Direction::Hold => 2,
        Direction::Buy => 1,
        Direction::Sell => 0,
    }
}

#[derive(Debug, Clone, Copy)]
struct Scores {
    consensus_percentage: f64,
    weighted_confidence: f64,
    coherence: f64,
    contradiction_ratio: f64,
    strength: f64,
}

impl Scores {
    fn is_finite(&self) -> bool {
        self.consensus_percentage.is_finite()
            && self.weighted_confidence.is_finite()
            && self.coherence.is_finite()
            && self.contradiction_ratio.is_finite()
            && self.strength.is_finite()
    }

    /// Safe substitute when scoring produced NaN/inf: neutral confidence,
    /// no claimed agreement.
    fn degraded() -> Self {
        Self {
            consensus_percentage: 0.0,
            weighted_confidence: DEGRADED_CONFIDENCE,
            coherence: 0.0,
            contradiction_ratio: 0.0,
            strength: 0.0,
        }
    }
}

/// Merges independent strategy opinions into one vetted decision.
///
/// `combine` is a pure function of its inputs: the engine holds only its
/// configuration and never reads the clock.
#[derive(Debug, Clone, Default)]
pub struct ConsensusEngine {
    config: ConsensusConfig,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ConsensusConfig) {
        self.config = config;
    }

    pub fn combine(&self, symbol: &str, opinions: &[StrategyOpinion]) -> ConsensusResult {
        let valid: Vec<StrategyOpinion> = opinions
            .iter()
            .filter(|op| op.is_valid())
            .cloned()
            .map(|mut op| {
                op.confidence = clamp_score(op.confidence);
                op
            })
            .collect();

        if valid.len() < opinions.len() {
            tracing::debug!(
                "Discarded {} invalid opinion(s) for {}",
                opinions.len() - valid.len(),
                symbol
            );
        }

        let tally = Tally::from_opinions(&valid);
        let dominant = tally.dominant();
        let timestamp = latest_timestamp(&valid);
        let reference_price = reference_price(&valid, dominant);

        if valid.len() < self.config.min_opinions.max(2) {
            tracing::debug!(
                "Insufficient inputs for {}: {} valid opinion(s)",
                symbol,
                valid.len()
            );
            let scores = self.score(&tally, dominant);
            let scores = if scores.is_finite() { scores } else { Scores::degraded() };
            return ConsensusResult {
                symbol: symbol.to_string(),
                decision: ConsensusDecision::Hold,
                direction: Direction::Hold,
                dominant,
                weighted_confidence: scores.weighted_confidence,
                consensus_percentage: scores.consensus_percentage,
                coherence_score: scores.coherence,
                quality_score: 0.0,
                strength_score: scores.strength,
                contradiction_ratio: scores.contradiction_ratio,
                counts: tally.counts,
                risk_level: ConsensusRiskLevel::High,
                flags: vec![ConsensusFlag::InsufficientInputs],
                reference_price,
                timestamp,
                opinions: valid,
            };
        }

        let mut flags = Vec::new();
        let scores = self.score(&tally, dominant);
        let (scores, risk_level) = if scores.is_finite() {
            (scores, derive_risk_level(&scores))
        } else {
            tracing::warn!("Consensus scoring for {} was not finite, degrading to HOLD", symbol);
            flags.push(ConsensusFlag::Degraded);
            (Scores::degraded(), ConsensusRiskLevel::High)
        };

        let (min_consensus, min_confidence) = if dominant == Direction::Hold {
            (self.config.hold_min_consensus, self.config.hold_min_confidence)
        } else {
            (self.config.min_consensus, self.config.min_confidence)
        };

        if scores.consensus_percentage < min_consensus {
            flags.push(ConsensusFlag::BelowConsensus);
        }
        if scores.weighted_confidence < min_confidence {
            flags.push(ConsensusFlag::BelowConfidence);
        }
        if scores.coherence < self.config.min_coherence {
            flags.push(ConsensusFlag::LowCoherence);
        }
        if scores.contradiction_ratio > self.config.max_contradiction {
            flags.push(ConsensusFlag::ContradictionExceeded);
        }
        if risk_level == ConsensusRiskLevel::High {
            flags.push(ConsensusFlag::HighRisk);
        }

        let decision = if flags.is_empty() && dominant.is_directional() {
            let tiered = ConsensusDecision::from_strength(dominant, scores.strength);
            if tiered == ConsensusDecision::Hold {
                flags.push(ConsensusFlag::WeakStrength);
            }
            tiered
        } else {
            ConsensusDecision::Hold
        };

        let base_quality = 0.4 * scores.coherence
            + 0.3 * scores.consensus_percentage
            + 0.3 * scores.weighted_confidence;
        let quality_score = clamp_score(base_quality - GATE_QUALITY_PENALTY * flags.len() as f64);

        tracing::debug!(
            "Consensus for {}: {:?} (dominant {}, consensus {:.1}%, confidence {:.1}, coherence {:.1}, strength {:.1})",
            symbol,
            decision,
            dominant,
            scores.consensus_percentage,
            scores.weighted_confidence,
            scores.coherence,
            scores.strength
        );

        ConsensusResult {
            symbol: symbol.to_string(),
            decision,
            direction: decision.direction(),
            dominant,
            weighted_confidence: scores.weighted_confidence,
            consensus_percentage: scores.consensus_percentage,
            coherence_score: scores.coherence,
            quality_score,
            strength_score: scores.strength,
            contradiction_ratio: scores.contradiction_ratio,
            counts: tally.counts,
            risk_level,
            flags,
            reference_price,
            timestamp,
            opinions: valid,
        }
    }

    fn score(&self, tally: &Tally, dominant: Direction) -> Scores {
        let total = tally.counts.total();
        if total == 0 {
            return Scores {
                consensus_percentage: 0.0,
                weighted_confidence: 0.0,
                coherence: 0.0,
                contradiction_ratio: 0.0,
                strength: 0.0,
            };
        }
        let total_f = total as f64;

        let max_count = tally.counts.get(dominant) as f64;
        let consensus_percentage = clamp_score(max_count / total_f * 100.0);

        // HOLD opinions stay in the denominator.
        let weighted_confidence = clamp_score(tally.weighted_confidence_sum / tally.total_weight());

        let contradiction_ratio = tally.counts.buy.min(tally.counts.sell) as f64 / total_f;

        let mut coherence = consensus_percentage;
        if tally.counts.buy > 0 && tally.counts.sell > 0 {
            coherence -= contradiction_ratio * self.config.contradiction_penalty;
        }
        if is_unanimous(&tally.counts, dominant) {
            coherence += self.config.unanimity_bonus;
        }
        let coherence = clamp_score(coherence);

        let strength = (consensus_percentage + weighted_confidence + coherence) / 3.0;

        Scores {
            consensus_percentage,
            weighted_confidence,
            coherence,
            contradiction_ratio,
            strength,
        }
    }
}

/// Unanimous means no strategy votes against the dominant direction: every
/// opinion agrees, or a directional majority faces no opposing side.
fn is_unanimous(counts: &DirectionCounts, dominant: Direction) -> bool {
    let total = counts.total();
    if total == 0 {
        return false;
    }
    match dominant {
        Direction::Buy => counts.sell == 0,
        Direction::Sell => counts.buy == 0,
        Direction::Hold => counts.hold == total,
    }
}

fn derive_risk_level(scores: &Scores) -> ConsensusRiskLevel {
    if scores.contradiction_ratio >= HIGH_RISK_CONTRADICTION
        || scores.coherence < 40.0
        || scores.weighted_confidence < 40.0
    {
        ConsensusRiskLevel::High
    } else if scores.coherence < 70.0 || scores.weighted_confidence < 60.0 {
        ConsensusRiskLevel::Medium
    } else {
        ConsensusRiskLevel::Low
    }
}

fn latest_timestamp(opinions: &[StrategyOpinion]) -> Option<DateTime<Utc>> {
    opinions.iter().map(|op| op.timestamp).max()
}

fn reference_price(opinions: &[StrategyOpinion], dominant: Direction) -> Option<f64> {
    weighted_price(opinions.iter().filter(|op| op.direction == dominant))
        .or_else(|| weighted_price(opinions.iter()))
}

fn weighted_price<'a>(opinions: impl Iterator<Item = &'a StrategyOpinion>) -> Option<f64> {
    let (sum, weight) = opinions.fold((0.0, 0.0), |(s, w), op| {
        (s + op.price * op.weight, w + op.weight)
    });
    if weight <= 0.0 {
        return None;
    }
    Some(sum / weight).filter(|p| p.is_finite())
}
