//! Risk metrics computation.
//!
//! [`RiskMetricsCalculator`] turns a window of per-tick returns and the
//! account's high-water mark into the numbers that make up a
//! [`RiskSnapshot`]: historical VaR/CVaR, annualized volatility, drawdown and
//! stress-test losses.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rp_types::{InsufficientDataError, MIN_RISK_SAMPLES};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Periods per year used to annualize per-tick volatility.
pub const ANNUALIZATION_PERIODS: u32 = 252;

/// Outcome of one stress scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressResult {
    pub scenario: String,
    pub shock_pct: Decimal,
    pub stressed_value: Decimal,
    /// Implied loss as a positive fraction of current value.
    pub loss_pct: Decimal,
    pub severe: bool,
}

/// The authoritative risk state of one account after one monitor tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub id: Uuid,
    pub account_id: String,
    pub timestamp: DateTime<Utc>,
    pub portfolio_value: Decimal,

    // --- tail ---
    /// Historical VaR as a positive fraction; zero without enough samples.
    pub var: Decimal,
    /// Expected shortfall beyond VaR as a positive fraction.
    pub cvar: Decimal,

    // --- drawdown ---
    /// Current decline from the all-time high-water mark (0–1 fraction).
    pub drawdown: Decimal,
    /// Largest drawdown observed so far; never decreases.
    pub max_drawdown: Decimal,

    /// Annualized standard deviation of window returns.
    pub volatility: Decimal,
    /// VaR as a fraction of the policy's risk budget (1.0 = fully used).
    pub risk_budget_used: Decimal,
    pub circuit_breaker_triggered: bool,

    /// Return observed on this tick, if there was a previous value.
    pub last_return: Option<Decimal>,
    pub sample_count: usize,
    /// Whether the window held enough samples for VaR/CVaR/volatility.
    pub sufficient_data: bool,
    pub stress_results: Vec<StressResult>,
}

/// `fraction` expressed in percent, saturating at the representable range.
pub(crate) fn as_percent(fraction: Decimal) -> Decimal {
    fraction.saturating_mul(Decimal::ONE_HUNDRED)
}

/// Stateless calculator for window-based risk metrics.
pub struct RiskMetricsCalculator;

impl RiskMetricsCalculator {
    /// Historical VaR and CVaR at `confidence`, both as positive loss
    /// fractions.
    ///
    /// VaR is the `(1 - confidence)` percentile of the sorted returns, taken
    /// at index `floor(n * (1 - confidence))`. CVaR is the negated mean of
    /// every return at or below that threshold.
    pub fn var_cvar(
        returns: &[Decimal],
        confidence: Decimal,
    ) -> Result<(Decimal, Decimal), InsufficientDataError> {
        Self::require_samples(returns)?;

        let mut sorted = returns.to_vec();
        sorted.sort();

        let tail_fraction = (Decimal::ONE - confidence).max(Decimal::ZERO);
        let idx = (Decimal::from(sorted.len()) * tail_fraction)
            .floor()
            .to_usize()
            .unwrap_or(0)
            .min(sorted.len() - 1);
        let threshold = sorted[idx];
        let var = (-threshold).max(Decimal::ZERO);

        let tail: Vec<Decimal> = sorted.iter().copied().filter(|r| *r <= threshold).collect();
        let cvar = if tail.is_empty() {
            var
        } else {
            let sum = tail.iter().fold(Decimal::ZERO, |acc, r| acc.saturating_add(*r));
            (-(sum / Decimal::from(tail.len()))).max(Decimal::ZERO)
        };

        Ok((var, cvar))
    }

    pub fn var(returns: &[Decimal], confidence: Decimal) -> Result<Decimal, InsufficientDataError> {
        Self::var_cvar(returns, confidence).map(|(var, _)| var)
    }

    pub fn cvar(returns: &[Decimal], confidence: Decimal) -> Result<Decimal, InsufficientDataError> {
        Self::var_cvar(returns, confidence).map(|(_, cvar)| cvar)
    }

    /// Sample standard deviation of `returns`, annualized by
    /// `sqrt(ANNUALIZATION_PERIODS)`.
    pub fn volatility(returns: &[Decimal]) -> Result<Decimal, InsufficientDataError> {
        Self::require_samples(returns)?;

        let n = Decimal::from(returns.len());
        let mean = returns
            .iter()
            .fold(Decimal::ZERO, |acc, r| acc.saturating_add(*r))
            / n;
        let variance = returns
            .iter()
            .fold(Decimal::ZERO, |acc, r| {
                let d = r.saturating_sub(mean);
                acc.saturating_add(d.saturating_mul(d))
            })
            / (n - Decimal::ONE);

        let per_tick = variance.sqrt().unwrap_or(Decimal::ZERO);
        let annualization = Decimal::from(ANNUALIZATION_PERIODS)
            .sqrt()
            .unwrap_or(Decimal::ONE);
        Ok(per_tick * annualization)
    }

    /// Decline from `peak` to `value` as a non-negative fraction.
    pub fn drawdown(peak: Decimal, value: Decimal) -> Decimal {
        if peak <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        peak.saturating_sub(value)
            .checked_div(peak)
            .unwrap_or(Decimal::MAX)
            .max(Decimal::ZERO)
    }

    /// Apply each shock to `value`; losses above `severe_loss_pct` are
    /// flagged severe.
    pub fn stress(
        value: Decimal,
        scenarios: &BTreeMap<String, Decimal>,
        severe_loss_pct: Decimal,
    ) -> Vec<StressResult> {
        scenarios
            .iter()
            .map(|(name, shock)| {
                let stressed_value = value.saturating_mul(Decimal::ONE.saturating_add(*shock));
                let loss_pct = if value > Decimal::ZERO {
                    value
                        .saturating_sub(stressed_value)
                        .checked_div(value)
                        .unwrap_or(Decimal::MAX)
                } else {
                    Decimal::ZERO
                };
                StressResult {
                    scenario: name.clone(),
                    shock_pct: *shock,
                    stressed_value,
                    loss_pct,
                    severe: loss_pct > severe_loss_pct,
                }
            })
            .collect()
    }

    fn require_samples(returns: &[Decimal]) -> Result<(), InsufficientDataError> {
        if returns.len() < MIN_RISK_SAMPLES {
            return Err(InsufficientDataError {
                required: MIN_RISK_SAMPLES,
                available: returns.len(),
            });
        }
        Ok(())
    }
}
