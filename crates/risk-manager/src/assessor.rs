use analysis_core::{indicators, Direction, TradeSide};
use kelly_position_sizer::KellyPositionSizer;
use market_regime_detector::{MarketRegime, MarketRegimeDetector};
use portfolio_manager::PortfolioState;

use crate::error::{finite, RiskError};
use crate::models::*;

/// Score reported by the fail-closed fallback (maps to `RiskLevel::High`).
pub const FALLBACK_RISK_SCORE: f64 = 70.0;

const LIQUIDITY_LOOKBACK: usize = 20;
/// Liquidity risk when there is no volume history at all.
const UNKNOWN_LIQUIDITY_RISK: f64 = 50.0;

fn clamp_score(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// Turns a directional decision plus a portfolio snapshot into an approval,
/// a position size and stop/target levels.
pub struct RiskAssessor {
    config: RiskConfig,
    regime_detector: MarketRegimeDetector,
    sizer: KellyPositionSizer,
}

impl RiskAssessor {
    pub fn new(config: RiskConfig) -> Result<Self, RiskError> {
        config.validate()?;
        let sizer = KellyPositionSizer::new(
            config.max_kelly_fraction,
            config.kelly_multiplier,
            config.max_position_fraction,
        )
        .map_err(|e| RiskError::Config(e.to_string()))?;

        Ok(Self {
            regime_detector: MarketRegimeDetector::with_min_bars(config.regime_min_bars),
            config,
            sizer,
        })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn set_min_confidence(&mut self, min_confidence: f64) -> Result<(), RiskError> {
        let mut next = self.config.clone();
        next.min_confidence = min_confidence;
        next.validate()?;
        self.config = next;
        Ok(())
    }

    /// Never fails: any internal error produces the conservative fallback
    /// (not approved, `RiskLevel::High`).
    pub fn assess(&self, proposal: &TradeProposal, portfolio: &PortfolioState) -> RiskAssessment {
        match self.try_assess(proposal, portfolio) {
            Ok(assessment) => assessment,
            Err(e) => {
                tracing::warn!("Risk assessment for {} failed, rejecting: {}", proposal.symbol, e);
                self.fallback(proposal, &e)
            }
        }
    }

    pub fn try_assess(
        &self,
        proposal: &TradeProposal,
        portfolio: &PortfolioState,
    ) -> Result<RiskAssessment, RiskError> {
        let entry = proposal.entry_price;
        if !entry.is_finite() || entry <= 0.0 {
            return Err(RiskError::InvalidInput(format!("entry price {}", entry)));
        }
        if !proposal.confidence.is_finite() {
            return Err(RiskError::InvalidInput("confidence is not finite".into()));
        }
        let confidence = clamp_score(proposal.confidence);

        let portfolio_value = portfolio.portfolio_value();
        if !portfolio_value.is_finite() || portfolio_value <= 0.0 {
            return Err(RiskError::EmptyPortfolio);
        }

        let regime = self.regime_detector.detect_regime(&proposal.bars).regime;
        let atr = indicators::atr(&proposal.bars, self.config.atr_period).filter(|a| *a > 0.0);

        let stop_loss = self.resolve_stop(proposal.side, entry, proposal.stop_loss, atr, regime)?;
        let stop_distance = finite((entry - stop_loss).abs(), "stop distance")?;
        let take_profit = self.resolve_target(proposal.side, entry, proposal.take_profit, stop_distance);
        let risk_reward_ratio = finite((take_profit - entry).abs() / stop_distance, "reward/risk")?;

        let atr_percent = match atr {
            Some(a) => finite(a / entry * 100.0, "ATR percent")?,
            None => self.config.fallback_stop_percent,
        };

        let factors = RiskFactors {
            confidence_risk: 100.0 - confidence,
            volatility_risk: clamp_score(atr_percent / self.config.reference_atr_percent * 100.0),
            drawdown_risk: clamp_score(
                portfolio.current_drawdown / self.config.max_drawdown_percent * 100.0,
            ),
            liquidity_risk: self.liquidity_risk(proposal),
            correlation_risk: clamp_score(
                portfolio.open_on_side(proposal.side) as f64
                    / self.config.max_open_positions as f64
                    * 100.0,
            ),
            regime_risk: regime_risk(regime, proposal.side),
        };
        let overall_risk_score =
            clamp_score(finite(factors.weighted(&self.config.factor_weights), "overall risk")?);
        let risk_level = RiskLevel::from_score(overall_risk_score);

        let sizing = self.size(
            confidence,
            entry,
            stop_loss,
            risk_reward_ratio,
            atr_percent,
            regime,
            portfolio,
        )?;

        let mut rejection_reasons = Vec::new();
        if risk_level.blocks_entry() {
            rejection_reasons.push(format!(
                "Risk level {:?} (score {:.1})",
                risk_level, overall_risk_score
            ));
        }
        if portfolio.current_drawdown >= self.config.max_drawdown_percent {
            rejection_reasons.push(format!(
                "Drawdown {:.2}% at or above limit {:.2}%",
                portfolio.current_drawdown, self.config.max_drawdown_percent
            ));
        }
        if confidence < self.config.min_confidence {
            rejection_reasons.push(format!(
                "Confidence {:.1} below minimum {:.1}",
                confidence, self.config.min_confidence
            ));
        }

        let raw_size = sizing
            .fixed_fractional
            .min(sizing.kelly)
            .min(sizing.volatility_adjusted);
        let size = if raw_size <= 0.0 {
            rejection_reasons.push("No positive position size".to_string());
            0.0
        } else if sizing.max_quantity < sizing.min_quantity {
            rejection_reasons.push("Portfolio too small for minimum position".to_string());
            0.0
        } else {
            raw_size.clamp(sizing.min_quantity, sizing.max_quantity)
        };

        let approved = rejection_reasons.is_empty();
        let recommended_size = if approved { size } else { 0.0 };

        tracing::debug!(
            "Risk for {} {}: score {:.1} ({:?}), size {:.6}, stop {:.4}, target {:.4}, regime {}",
            proposal.side,
            proposal.symbol,
            overall_risk_score,
            risk_level,
            recommended_size,
            stop_loss,
            take_profit,
            regime.name()
        );

        Ok(RiskAssessment {
            symbol: proposal.symbol.clone(),
            side: proposal.side,
            approved,
            overall_risk_score,
            risk_level,
            factors,
            regime,
            recommended_size,
            recommended_notional: recommended_size * entry,
            entry_price: entry,
            stop_loss_price: stop_loss,
            take_profit_price: take_profit,
            risk_reward_ratio,
            trailing_distance: stop_distance / entry,
            sizing,
            rejection_reasons,
            fallback: false,
        })
    }

    /// Keep a caller-supplied stop when it sits on the protective side of the
    /// entry; otherwise derive one from ATR × regime multiplier, or from the
    /// fallback percentage when ATR is unavailable.
    fn resolve_stop(
        &self,
        side: TradeSide,
        entry: f64,
        supplied: Option<f64>,
        atr: Option<f64>,
        regime: MarketRegime,
    ) -> Result<f64, RiskError> {
        if let Some(stop) = supplied {
            if stop.is_finite() && stop > 0.0 && on_protective_side(side, entry, stop) {
                return Ok(stop);
            }
            tracing::debug!(
                "Correcting {} stop {:.4} for entry {:.4}",
                side, stop, entry
            );
        }

        let pct_distance = entry * self.config.fallback_stop_percent / 100.0;
        let distance = atr
            .map(|a| a * regime.atr_stop_multiplier())
            .filter(|d| d.is_finite() && *d > 0.0)
            .unwrap_or(pct_distance);

        let stop = match side {
            TradeSide::Buy => {
                let stop = entry - distance;
                if stop > 0.0 {
                    stop
                } else {
                    entry - pct_distance
                }
            }
            TradeSide::Sell => entry + distance,
        };

        let stop = finite(stop, "stop loss")?;
        if !on_protective_side(side, entry, stop) {
            return Err(RiskError::NonFinite("stop loss"));
        }
        Ok(stop)
    }

    fn resolve_target(&self, side: TradeSide, entry: f64, supplied: Option<f64>, stop_distance: f64) -> f64 {
        if let Some(target) = supplied {
            let on_side = match side {
                TradeSide::Buy => target > entry,
                TradeSide::Sell => target < entry && target > 0.0,
            };
            if target.is_finite() && on_side {
                return target;
            }
        }

        let reward = stop_distance * self.config.reward_risk_ratio;
        match side {
            TradeSide::Buy => entry + reward,
            // A short cannot target below zero.
            TradeSide::Sell => (entry - reward).max(entry * 0.01),
        }
    }

    fn liquidity_risk(&self, proposal: &TradeProposal) -> f64 {
        match indicators::average_volume(&proposal.bars, LIQUIDITY_LOOKBACK) {
            None => UNKNOWN_LIQUIDITY_RISK,
            Some(v) if !v.is_finite() || v <= 0.0 => 100.0,
            Some(_) if self.config.min_avg_volume <= 0.0 => 0.0,
            Some(v) => clamp_score(self.config.min_avg_volume / v * 100.0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn size(
        &self,
        confidence: f64,
        entry: f64,
        stop_loss: f64,
        risk_reward_ratio: f64,
        atr_percent: f64,
        regime: MarketRegime,
        portfolio: &PortfolioState,
    ) -> Result<SizingBreakdown, RiskError> {
        let portfolio_value = portfolio.portfolio_value();
        let risk_budget = portfolio_value * self.config.risk_per_trade_percent / 100.0;

        let fixed_fractional = self
            .sizer
            .calculate_risk_based(portfolio_value, risk_budget, entry, stop_loss)
            .map_err(|e| RiskError::InvalidInput(e.to_string()))?
            .quantity;

        let kelly = self
            .sizer
            .calculate_from_confidence(confidence, risk_reward_ratio, portfolio_value, entry)
            .map_err(|e| RiskError::InvalidInput(e.to_string()))?
            .quantity;

        // Notional whose typical daily move equals the volatility budget.
        let volatility_adjusted = finite(
            portfolio_value * self.config.target_volatility_percent / atr_percent
                * regime.risk_multiplier()
                / entry,
            "volatility-adjusted size",
        )?;

        let min_quantity = self.config.min_position_notional / entry;
        let max_quantity = (self.config.max_position_fraction * portfolio_value / entry)
            .min(portfolio.cash().max(0.0) / entry);

        Ok(SizingBreakdown {
            fixed_fractional: finite(fixed_fractional, "fixed-fractional size")?,
            kelly: finite(kelly, "Kelly size")?,
            volatility_adjusted,
            min_quantity,
            max_quantity,
        })
    }

    /// Conservative stand-in for an assessment that could not be computed.
    fn fallback(&self, proposal: &TradeProposal, error: &RiskError) -> RiskAssessment {
        let entry = if proposal.entry_price.is_finite() && proposal.entry_price > 0.0 {
            proposal.entry_price
        } else {
            0.0
        };
        let distance = entry * self.config.fallback_stop_percent / 100.0;
        let (stop_loss_price, take_profit_price) = match proposal.side {
            TradeSide::Buy => (entry - distance, entry + distance * self.config.reward_risk_ratio),
            TradeSide::Sell => (entry + distance, entry - distance * self.config.reward_risk_ratio),
        };

        RiskAssessment {
            symbol: proposal.symbol.clone(),
            side: proposal.side,
            approved: false,
            overall_risk_score: FALLBACK_RISK_SCORE,
            risk_level: RiskLevel::High,
            factors: RiskFactors::default(),
            regime: MarketRegime::Unknown,
            recommended_size: 0.0,
            recommended_notional: 0.0,
            entry_price: entry,
            stop_loss_price,
            take_profit_price,
            risk_reward_ratio: self.config.reward_risk_ratio,
            trailing_distance: self.config.fallback_stop_percent / 100.0,
            sizing: SizingBreakdown::default(),
            rejection_reasons: vec![format!("Assessment failed: {}", error)],
            fallback: true,
        }
    }
}

fn on_protective_side(side: TradeSide, entry: f64, stop: f64) -> bool {
    match side {
        TradeSide::Buy => stop < entry,
        TradeSide::Sell => stop > entry,
    }
}

/// Trends help trades that go with them and hurt trades that fight them.
fn regime_risk(regime: MarketRegime, side: TradeSide) -> f64 {
    match regime {
        MarketRegime::Volatile => 80.0,
        MarketRegime::Unknown => 60.0,
        MarketRegime::Ranging => 40.0,
        MarketRegime::Calm => 30.0,
        MarketRegime::TrendingBullish | MarketRegime::TrendingBearish => {
            if regime.trend_direction() == Some(Direction::from(side)) {
                20.0
            } else {
                70.0
            }
        }
    }
}
