use anyhow::{bail, Result};
use log::debug;
use serde::{Deserialize, Serialize};

/// Raw Kelly fraction f* = (b·p − q) / b.
///
///   p = probability of winning
///   q = 1 − p
///   b = payoff ratio (reward / risk)
///
/// Returns 0.0 for degenerate inputs. The result may be negative when there
/// is no edge; callers decide whether that means "do not trade".
pub fn kelly_fraction(win_probability: f64, payoff_ratio: f64) -> f64 {
    if !win_probability.is_finite() || !payoff_ratio.is_finite() || payoff_ratio <= 0.0 {
        return 0.0;
    }
    let p = win_probability.clamp(0.0, 1.0);
    let q = 1.0 - p;
    (payoff_ratio * p - q) / payoff_ratio
}

/// Kelly Criterion position sizing calculator
///
/// Produces fractional quantities: the ledger trades in units of the base
/// asset, so nothing is rounded to whole shares here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyPositionSizer {
    /// Cap on the (multiplied) Kelly fraction, e.g. 0.25
    pub max_kelly_fraction: f64,

    /// Fractional Kelly multiplier (0.5 = half-Kelly)
    pub kelly_multiplier: f64,

    /// Maximum position size as fraction of portfolio (e.g., 0.10 = 10%)
    pub max_position_size: f64,
}

/// Position sizing recommendation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSize {
    /// Fraction of portfolio to allocate (0.0 to 1.0)
    pub fraction: f64,

    /// Notional value at the reference price
    pub notional: f64,

    /// Quantity of the base asset
    pub quantity: f64,

    /// Kelly fraction before multiplier and caps (0.0 for risk-based sizing)
    pub raw_kelly_fraction: f64,

    pub reasoning: String,
}

impl Default for KellyPositionSizer {
    fn default() -> Self {
        Self {
            max_kelly_fraction: 0.25,
            kelly_multiplier: 0.5, // half-Kelly
            max_position_size: 0.10,
        }
    }
}

impl KellyPositionSizer {
    pub fn new(
        max_kelly_fraction: f64,
        kelly_multiplier: f64,
        max_position_size: f64,
    ) -> Result<Self> {
        if max_kelly_fraction <= 0.0 || max_kelly_fraction > 1.0 {
            bail!("max_kelly_fraction must be between 0 and 1");
        }
        if kelly_multiplier <= 0.0 || kelly_multiplier > 1.0 {
            bail!("kelly_multiplier must be between 0 and 1");
        }
        if max_position_size <= 0.0 || max_position_size > 1.0 {
            bail!("max_position_size must be between 0 and 1");
        }

        Ok(Self {
            max_kelly_fraction,
            kelly_multiplier,
            max_position_size,
        })
    }

    /// Quarter-Kelly with a 5% position cap
    pub fn conservative() -> Self {
        Self {
            max_kelly_fraction: 0.15,
            kelly_multiplier: 0.25,
            max_position_size: 0.05,
        }
    }

    /// Kelly size from a signal confidence (0-100, read as win probability)
    /// and the planned reward/risk ratio.
    pub fn calculate_from_confidence(
        &self,
        confidence: f64,
        payoff_ratio: f64,
        portfolio_value: f64,
        current_price: f64,
    ) -> Result<PositionSize> {
        if !(0.0..=100.0).contains(&confidence) {
            bail!("Confidence must be between 0 and 100");
        }
        if payoff_ratio <= 0.0 || !payoff_ratio.is_finite() {
            bail!("Payoff ratio must be positive");
        }
        if portfolio_value <= 0.0 || current_price <= 0.0 {
            bail!("Portfolio value and price must be positive");
        }

        let p = confidence / 100.0;
        let raw_kelly = kelly_fraction(p, payoff_ratio);

        let fraction = (raw_kelly * self.kelly_multiplier)
            .max(0.0) // No edge, no position
            .min(self.max_kelly_fraction)
            .min(self.max_position_size);

        let notional = portfolio_value * fraction;
        let quantity = notional / current_price;

        debug!(
            "Kelly sizing: raw {:.3}, final {:.3} (p={:.2}, b={:.2})",
            raw_kelly, fraction, p, payoff_ratio
        );

        Ok(PositionSize {
            fraction,
            notional,
            quantity,
            raw_kelly_fraction: raw_kelly,
            reasoning: format!(
                "Kelly: {:.2}% (raw: {:.2}%, p: {:.1}%, reward/risk: {:.2})",
                fraction * 100.0,
                raw_kelly * 100.0,
                p * 100.0,
                payoff_ratio
            ),
        })
    }

    /// Fixed-fractional sizing from stop distance. Works for both long and
    /// short entries: only |entry − stop| matters.
    pub fn calculate_risk_based(
        &self,
        portfolio_value: f64,
        max_risk_dollars: f64,
        current_price: f64,
        stop_loss_price: f64,
    ) -> Result<PositionSize> {
        let risk_per_unit = (current_price - stop_loss_price).abs();
        if !risk_per_unit.is_finite() || risk_per_unit <= 0.0 {
            bail!("Stop loss must differ from the entry price");
        }
        if portfolio_value <= 0.0 || current_price <= 0.0 {
            bail!("Portfolio value and price must be positive");
        }
        if max_risk_dollars < 0.0 {
            bail!("Risk budget cannot be negative");
        }

        let quantity = max_risk_dollars / risk_per_unit;
        let fraction = (quantity * current_price / portfolio_value).min(self.max_position_size);
        let quantity = fraction * portfolio_value / current_price;

        Ok(PositionSize {
            fraction,
            notional: quantity * current_price,
            quantity,
            raw_kelly_fraction: 0.0,
            reasoning: format!(
                "Risk-based sizing: ${:.2} risk, ${:.4} per unit risk, {:.2}% position",
                max_risk_dollars,
                risk_per_unit,
                fraction * 100.0
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_kelly_fraction_formula() {
        // (2 * 0.6 - 0.4) / 2 = 0.4
        assert_relative_eq!(kelly_fraction(0.6, 2.0), 0.4, epsilon = 1e-12);
        assert_relative_eq!(kelly_fraction(0.5, 1.0), 0.0, epsilon = 1e-12);
        assert!(kelly_fraction(0.3, 1.0) < 0.0);
        assert_eq!(kelly_fraction(0.6, 0.0), 0.0);
        assert_eq!(kelly_fraction(f64::NAN, 2.0), 0.0);
    }

    #[test]
    fn test_confidence_sizing_capped() {
        let sizer = KellyPositionSizer::default();

        let result = sizer
            .calculate_from_confidence(60.0, 2.0, 10_000.0, 100.0)
            .unwrap();

        // Half-Kelly = 0.2, capped by max position 0.10
        assert_relative_eq!(result.fraction, 0.10, epsilon = 0.001);
        assert_relative_eq!(result.quantity, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_confidence_sizing_no_edge() {
        let sizer = KellyPositionSizer::default();

        let result = sizer
            .calculate_from_confidence(30.0, 1.0, 10_000.0, 100.0)
            .unwrap();

        assert_eq!(result.fraction, 0.0);
        assert_eq!(result.quantity, 0.0);
        assert!(result.raw_kelly_fraction < 0.0);
    }

    #[test]
    fn test_confidence_sizing_rejects_bad_input() {
        let sizer = KellyPositionSizer::default();
        assert!(sizer.calculate_from_confidence(120.0, 2.0, 10_000.0, 100.0).is_err());
        assert!(sizer.calculate_from_confidence(60.0, 0.0, 10_000.0, 100.0).is_err());
        assert!(sizer.calculate_from_confidence(60.0, 2.0, 0.0, 100.0).is_err());
    }

    #[test]
    fn test_risk_based_sizing() {
        let sizer = KellyPositionSizer::new(0.25, 0.5, 1.0).unwrap();

        let result = sizer
            .calculate_risk_based(10_000.0, 200.0, 100.0, 95.0)
            .unwrap();

        // Risk per unit = $5, max risk = $200 => 40 units
        assert_relative_eq!(result.quantity, 40.0, epsilon = 1e-9);
        assert_relative_eq!(result.fraction, 0.40, epsilon = 1e-9);
    }

    #[test]
    fn test_risk_based_sizing_short_side() {
        let sizer = KellyPositionSizer::new(0.25, 0.5, 1.0).unwrap();

        let long = sizer.calculate_risk_based(10_000.0, 200.0, 100.0, 95.0).unwrap();
        let short = sizer.calculate_risk_based(10_000.0, 200.0, 100.0, 105.0).unwrap();
        assert_relative_eq!(long.quantity, short.quantity, epsilon = 1e-9);
    }

    #[test]
    fn test_risk_based_sizing_capped() {
        let sizer = KellyPositionSizer::default();

        let result = sizer
            .calculate_risk_based(10_000.0, 200.0, 100.0, 95.0)
            .unwrap();

        // (0.10 * 10000) / 100
        assert_relative_eq!(result.quantity, 10.0, epsilon = 1e-9);
        assert!(sizer.calculate_risk_based(10_000.0, 200.0, 100.0, 100.0).is_err());
    }

    #[test]
    fn test_new_validates() {
        assert!(KellyPositionSizer::new(0.0, 0.5, 0.1).is_err());
        assert!(KellyPositionSizer::new(0.25, 1.5, 0.1).is_err());
        assert!(KellyPositionSizer::new(0.25, 0.5, 0.0).is_err());
    }

    #[test]
    fn test_conservative_mode() {
        let sizer = KellyPositionSizer::conservative();

        assert_eq!(sizer.max_kelly_fraction, 0.15);
        assert_eq!(sizer.kelly_multiplier, 0.25);
        assert_eq!(sizer.max_position_size, 0.05);
    }
}
