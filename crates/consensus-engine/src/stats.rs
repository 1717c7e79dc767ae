use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ConsensusFlag, ConsensusResult};

/// Aggregate view over every result an engine has produced, reported through
/// the engine status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusStats {
    pub total: u64,
    pub directional: u64,
    pub holds: u64,
    pub insufficient_inputs: u64,
    /// Results whose dominant side was directional but failed a gate.
    pub gated: u64,
    /// Count per decision label ("Strong Buy", "Hold", ...).
    pub by_decision: BTreeMap<String, u64>,
    pub avg_coherence: f64,
    pub avg_quality: f64,
    pub avg_weighted_confidence: f64,
}

impl ConsensusStats {
    pub fn record(&mut self, result: &ConsensusResult) {
        self.total += 1;
        let n = self.total as f64;

        if result.decision.is_directional() {
            self.directional += 1;
        } else {
            self.holds += 1;
            if result.dominant.is_directional() && !result.flags.is_empty() {
                self.gated += 1;
            }
        }
        if result.has_flag(ConsensusFlag::InsufficientInputs) {
            self.insufficient_inputs += 1;
        }

        *self
            .by_decision
            .entry(result.decision.to_label().to_string())
            .or_insert(0) += 1;

        // Running means
        self.avg_coherence += (result.coherence_score - self.avg_coherence) / n;
        self.avg_quality += (result.quality_score - self.avg_quality) / n;
        self.avg_weighted_confidence +=
            (result.weighted_confidence - self.avg_weighted_confidence) / n;
    }

    pub fn directional_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.directional as f64 / self.total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConsensusConfig, ConsensusEngine};
    use analysis_core::{Direction, StrategyOpinion};
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn op(direction: Direction, confidence: f64) -> StrategyOpinion {
        StrategyOpinion::new("s", "BTC-USD", direction, confidence, 100.0, Utc::now())
    }

    #[test]
    fn test_record_counts_and_means() {
        let engine = ConsensusEngine::new(ConsensusConfig::default());
        let mut stats = ConsensusStats::default();

        let buy = engine.combine("BTC-USD", &[op(Direction::Buy, 80.0), op(Direction::Buy, 80.0)]);
        let single = engine.combine("BTC-USD", &[op(Direction::Buy, 80.0)]);
        let split = engine.combine("BTC-USD", &[op(Direction::Buy, 80.0), op(Direction::Sell, 80.0)]);

        stats.record(&buy);
        stats.record(&single);
        stats.record(&split);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.directional, 1);
        assert_eq!(stats.holds, 2);
        assert_eq!(stats.insufficient_inputs, 1);
        assert_eq!(stats.gated, 2);
        assert_eq!(stats.by_decision.get("Hold"), Some(&2));
        assert_relative_eq!(stats.directional_rate(), 1.0 / 3.0);

        let expected = (buy.coherence_score + single.coherence_score + split.coherence_score) / 3.0;
        assert_relative_eq!(stats.avg_coherence, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_stats() {
        let stats = ConsensusStats::default();
        assert_eq!(stats.directional_rate(), 0.0);
    }
}
