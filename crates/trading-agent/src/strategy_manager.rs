use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use analysis_core::{AnalysisError, Bar, StrategyOpinion, StrategyUnit};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::strategies::{
    BreakoutStrategy, MeanReversionStrategy, MomentumStrategy, TrendFollowingStrategy,
};

/// What happened to one strategy unit during a gather.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Opinion,
    Abstained { reason: Option<String> },
    Failed { error: String },
    TimedOut { after_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub strategy_id: String,
    pub outcome: UnitOutcome,
}

/// Opinions that made it through plus a per-unit account of the rest.
#[derive(Debug, Clone, Default)]
pub struct Gathered {
    pub opinions: Vec<StrategyOpinion>,
    pub reports: Vec<UnitReport>,
}

impl Gathered {
    pub fn excluded(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome != UnitOutcome::Opinion)
            .count()
    }
}

/// Fans a bar series out to every strategy unit and collects their opinions.
pub struct StrategyManager {
    units: Vec<Arc<dyn StrategyUnit>>,
    weights: BTreeMap<String, f64>,
    timeout: Duration,
}

impl StrategyManager {
    pub fn new(
        units: Vec<Arc<dyn StrategyUnit>>,
        weights: BTreeMap<String, f64>,
        timeout: Duration,
    ) -> Self {
        Self {
            units,
            weights,
            timeout,
        }
    }

    /// The four built-in units.
    pub fn with_default_units(weights: BTreeMap<String, f64>, timeout: Duration) -> Self {
        let units: Vec<Arc<dyn StrategyUnit>> = vec![
            Arc::new(MomentumStrategy::default()),
            Arc::new(MeanReversionStrategy::default()),
            Arc::new(TrendFollowingStrategy::default()),
            Arc::new(BreakoutStrategy::default()),
        ];
        Self::new(units, weights, timeout)
    }

    pub fn strategy_count(&self) -> usize {
        self.units.len()
    }

    pub fn set_weights(&mut self, weights: BTreeMap<String, f64>) {
        self.weights = weights;
    }

    /// Units without a configured weight vote with weight 1 / unit count.
    fn weight_for(&self, id: &str) -> f64 {
        self.weights
            .get(id)
            .copied()
            .unwrap_or_else(|| 1.0 / self.units.len().max(1) as f64)
    }

    /// Evaluate every unit concurrently, each bounded by the configured
    /// timeout. A slow or failing unit is excluded, never awaited past its
    /// deadline.
    pub async fn gather(&self, symbol: &str, bars: &[Bar]) -> Gathered {
        let timeout_ms = self.timeout.as_millis() as u64;

        let evaluations = self.units.iter().map(|unit| async move {
            let id = unit.id().to_string();
            let result = tokio::time::timeout(self.timeout, unit.evaluate(symbol, bars)).await;
            (id, result)
        });

        let mut gathered = Gathered::default();
        for (id, result) in join_all(evaluations).await {
            let outcome = match result {
                Ok(Ok(Some(opinion))) => {
                    let opinion = opinion.with_weight(self.weight_for(&id));
                    if opinion.is_valid() {
                        gathered.opinions.push(opinion);
                        UnitOutcome::Opinion
                    } else {
                        tracing::debug!("{} produced an unusable opinion for {}", id, symbol);
                        UnitOutcome::Abstained {
                            reason: Some("invalid opinion".to_string()),
                        }
                    }
                }
                Ok(Ok(None)) => UnitOutcome::Abstained { reason: None },
                Ok(Err(e)) if e.is_data_error() => {
                    tracing::debug!("{} abstained on {}: {}", id, symbol, e);
                    UnitOutcome::Abstained {
                        reason: Some(e.to_string()),
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!("Strategy {} failed on {}: {}", id, symbol, e);
                    UnitOutcome::Failed {
                        error: e.to_string(),
                    }
                }
                Err(_) => {
                    let e = AnalysisError::Timeout {
                        operation: format!("{} on {}", id, symbol),
                        timeout_ms,
                    };
                    tracing::warn!("Strategy excluded: {}", e);
                    UnitOutcome::TimedOut {
                        after_ms: timeout_ms,
                    }
                }
            };
            gathered.reports.push(UnitReport {
                strategy_id: id,
                outcome,
            });
        }

        gathered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::Direction;
    use async_trait::async_trait;
    use chrono::Utc;

    struct Fixed {
        id: &'static str,
        behaviour: Behaviour,
    }

    enum Behaviour {
        Vote(Direction, f64),
        Abstain,
        Fail,
        Hang,
    }

    #[async_trait]
    impl StrategyUnit for Fixed {
        fn id(&self) -> &str {
            self.id
        }

        async fn evaluate(
            &self,
            symbol: &str,
            _bars: &[Bar],
        ) -> Result<Option<StrategyOpinion>, AnalysisError> {
            match self.behaviour {
                Behaviour::Vote(direction, confidence) => Ok(Some(StrategyOpinion::new(
                    self.id,
                    symbol,
                    direction,
                    confidence,
                    100.0,
                    Utc::now(),
                ))),
                Behaviour::Abstain => Err(AnalysisError::InsufficientData("short".into())),
                Behaviour::Fail => Err(AnalysisError::CalculationError("boom".into())),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok(None)
                }
            }
        }
    }

    fn unit(id: &'static str, behaviour: Behaviour) -> Arc<dyn StrategyUnit> {
        Arc::new(Fixed { id, behaviour })
    }

    #[tokio::test]
    async fn test_gather_excludes_slow_and_failing_units() {
        let weights: BTreeMap<String, f64> =
            [("a".to_string(), 0.6), ("b".to_string(), 0.4)].into_iter().collect();
        let manager = StrategyManager::new(
            vec![
                unit("a", Behaviour::Vote(Direction::Buy, 80.0)),
                unit("b", Behaviour::Vote(Direction::Sell, 60.0)),
                unit("c", Behaviour::Abstain),
                unit("d", Behaviour::Fail),
                unit("e", Behaviour::Hang),
            ],
            weights,
            Duration::from_millis(250),
        );

        let gathered = manager.gather("BTCUSDT", &[]).await;

        assert_eq!(gathered.opinions.len(), 2);
        assert_eq!(gathered.opinions[0].weight, 0.6);
        assert_eq!(gathered.opinions[1].weight, 0.4);
        assert_eq!(gathered.excluded(), 3);
        assert!(matches!(gathered.reports[2].outcome, UnitOutcome::Abstained { .. }));
        assert!(matches!(gathered.reports[3].outcome, UnitOutcome::Failed { .. }));
        assert_eq!(
            gathered.reports[4].outcome,
            UnitOutcome::TimedOut { after_ms: 250 }
        );
    }

    #[tokio::test]
    async fn test_unweighted_unit_gets_equal_share() {
        let manager = StrategyManager::new(
            vec![
                unit("a", Behaviour::Vote(Direction::Buy, 80.0)),
                unit("b", Behaviour::Vote(Direction::Buy, 70.0)),
            ],
            BTreeMap::new(),
            Duration::from_secs(1),
        );
        let gathered = manager.gather("X", &[]).await;
        assert!(gathered.opinions.iter().all(|o| o.weight == 0.5));
    }

    #[tokio::test]
    async fn test_default_units_abstain_without_history() {
        let manager = StrategyManager::with_default_units(BTreeMap::new(), Duration::from_secs(1));
        assert_eq!(manager.strategy_count(), 4);
        let gathered = manager.gather("X", &[]).await;
        assert!(gathered.opinions.is_empty());
        assert_eq!(gathered.excluded(), 4);
    }
}
