//! Position sizing: fixed-fraction, Kelly criterion and ATR-scaled.
//!
//! Every sizer returns a non-negative quantity in instrument units. Bad
//! inputs (non-positive price or account value, missing ATR) and a tripped
//! circuit breaker on the supplied [`RiskSnapshot`] all size to zero.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metrics::RiskSnapshot;

/// Inputs for one sizing decision.
#[derive(Debug, Clone)]
pub struct SizingRequest {
    pub account_value: Decimal,
    pub price: Decimal,
    pub atr: Option<Decimal>,
    /// Latest published risk state for the account, if available.
    pub risk: Option<Arc<RiskSnapshot>>,
}

impl SizingRequest {
    pub fn new(account_value: Decimal, price: Decimal) -> Self {
        Self {
            account_value,
            price,
            atr: None,
            risk: None,
        }
    }

    pub fn with_atr(mut self, atr: Decimal) -> Self {
        self.atr = Some(atr);
        self
    }

    pub fn with_risk(mut self, risk: Arc<RiskSnapshot>) -> Self {
        self.risk = Some(risk);
        self
    }

    /// Whether the request must size to zero regardless of method.
    fn blocked(&self) -> bool {
        self.price <= Decimal::ZERO
            || self.account_value <= Decimal::ZERO
            || self
                .risk
                .as_ref()
                .is_some_and(|r| r.circuit_breaker_triggered)
    }
}

pub trait PositionSizer: Send + Sync {
    fn name(&self) -> &str;

    /// Quantity to trade, never negative.
    fn size(&self, req: &SizingRequest) -> Decimal;
}

/// Risk a fixed fraction of account value, capped at a maximum position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedFractionSizer {
    pub risk_pct: Decimal,
    pub max_position_pct: Decimal,
}

impl FixedFractionSizer {
    pub fn new(risk_pct: Decimal, max_position_pct: Decimal) -> Self {
        Self {
            risk_pct,
            max_position_pct,
        }
    }
}

impl PositionSizer for FixedFractionSizer {
    fn name(&self) -> &str {
        "fixed_fraction"
    }

    fn size(&self, req: &SizingRequest) -> Decimal {
        if req.blocked() {
            return Decimal::ZERO;
        }
        let notional = (req.account_value * self.risk_pct).min(req.account_value * self.max_position_pct);
        (notional / req.price).max(Decimal::ZERO)
    }
}

/// Running win/loss tallies for Kelly sizing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStatistics {
    pub wins: u64,
    pub losses: u64,
    pub win_sum: Decimal,
    /// Sum of loss magnitudes (positive).
    pub loss_sum: Decimal,
}

impl TradeStatistics {
    pub fn trades(&self) -> u64 {
        self.wins + self.losses
    }

    pub fn win_rate(&self) -> Decimal {
        match self.trades() {
            0 => Decimal::ZERO,
            n => Decimal::from(self.wins) / Decimal::from(n),
        }
    }

    /// Average win over average loss. `None` when there are no losses.
    pub fn payoff_ratio(&self) -> Option<Decimal> {
        if self.losses == 0 || self.loss_sum.is_zero() {
            return None;
        }
        if self.wins == 0 {
            return Some(Decimal::ZERO);
        }
        let avg_win = self.win_sum / Decimal::from(self.wins);
        let avg_loss = self.loss_sum / Decimal::from(self.losses);
        Some(avg_win / avg_loss)
    }
}

/// Fractional Kelly: `f = fraction * max(0, (b*p - q) / b)`, capped at
/// `max_position_pct`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KellySizer {
    pub fraction: Decimal,
    pub max_position_pct: Decimal,
    pub min_trades: u64,
    stats: TradeStatistics,
}

impl KellySizer {
    pub fn new(fraction: Decimal, max_position_pct: Decimal, min_trades: u64) -> Self {
        Self {
            fraction,
            max_position_pct,
            min_trades,
            stats: TradeStatistics::default(),
        }
    }

    /// Fold one closed trade into the statistics. Flat trades are ignored.
    pub fn update_statistics(&mut self, pnl: Decimal) {
        if pnl > Decimal::ZERO {
            self.stats.wins += 1;
            self.stats.win_sum += pnl;
        } else if pnl < Decimal::ZERO {
            self.stats.losses += 1;
            self.stats.loss_sum += pnl.abs();
        }
    }

    pub fn statistics(&self) -> &TradeStatistics {
        &self.stats
    }

    /// Capital fraction to allocate, in `[0, max_position_pct]`.
    pub fn kelly_fraction(&self) -> Decimal {
        if self.stats.trades() < self.min_trades {
            debug!(
                trades = self.stats.trades(),
                min_trades = self.min_trades,
                "insufficient trade history for Kelly sizing"
            );
            return Decimal::ZERO;
        }

        let p = self.stats.win_rate();
        let q = Decimal::ONE - p;
        let raw = match self.stats.payoff_ratio() {
            // No losses yet: edge is the win rate itself.
            None => p,
            Some(b) if b.is_zero() => return Decimal::ZERO,
            Some(b) => (b * p - q) / b,
        };

        (self.fraction * raw.max(Decimal::ZERO))
            .min(self.max_position_pct)
            .max(Decimal::ZERO)
    }
}

impl PositionSizer for KellySizer {
    fn name(&self) -> &str {
        "kelly"
    }

    fn size(&self, req: &SizingRequest) -> Decimal {
        if req.blocked() {
            return Decimal::ZERO;
        }
        req.account_value * self.kelly_fraction() / req.price
    }
}

/// Volatility-scaled sizing: risk `risk_pct` of account value over a stop
/// `atr_multiplier` ATRs away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrSizer {
    pub risk_pct: Decimal,
    pub atr_multiplier: Decimal,
    pub max_position_pct: Decimal,
}

impl AtrSizer {
    pub fn new(risk_pct: Decimal, atr_multiplier: Decimal, max_position_pct: Decimal) -> Self {
        Self {
            risk_pct,
            atr_multiplier,
            max_position_pct,
        }
    }
}

impl PositionSizer for AtrSizer {
    fn name(&self) -> &str {
        "atr"
    }

    fn size(&self, req: &SizingRequest) -> Decimal {
        if req.blocked() {
            return Decimal::ZERO;
        }
        let Some(atr) = req.atr.filter(|a| *a > Decimal::ZERO) else {
            return Decimal::ZERO;
        };
        let stop_distance = atr * self.atr_multiplier;
        if stop_distance <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let units = req.account_value * self.risk_pct / stop_distance;
        let cap = req.account_value * self.max_position_pct / req.price;
        units.min(cap).max(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn snapshot(tripped: bool) -> Arc<RiskSnapshot> {
        Arc::new(RiskSnapshot {
            id: Uuid::new_v4(),
            account_id: "acc-1".into(),
            timestamp: Utc::now(),
            portfolio_value: dec!(100_000),
            var: dec!(0),
            cvar: dec!(0),
            drawdown: dec!(0),
            max_drawdown: dec!(0),
            volatility: dec!(0),
            risk_budget_used: dec!(0),
            circuit_breaker_triggered: tripped,
            last_return: None,
            sample_count: 0,
            sufficient_data: false,
            stress_results: Vec::new(),
        })
    }

    #[test]
    fn fixed_fraction_takes_the_smaller_of_risk_and_cap() {
        let sizer = FixedFractionSizer::new(dec!(0.02), dec!(0.10));
        let req = SizingRequest::new(dec!(100_000), dec!(50));
        assert_eq!(sizer.size(&req), dec!(40));

        let capped = FixedFractionSizer::new(dec!(0.30), dec!(0.10));
        assert_eq!(capped.size(&req), dec!(200));
    }

    #[test]
    fn bad_inputs_size_to_zero() {
        let sizer = FixedFractionSizer::new(dec!(0.02), dec!(0.10));
        assert_eq!(sizer.size(&SizingRequest::new(dec!(100_000), dec!(0))), dec!(0));
        assert_eq!(sizer.size(&SizingRequest::new(dec!(-5), dec!(10))), dec!(0));
        assert_eq!(
            AtrSizer::new(dec!(0.01), dec!(2), dec!(0.5)).size(&SizingRequest::new(dec!(100_000), dec!(10))),
            dec!(0)
        );
    }

    #[test]
    fn tripped_breaker_blocks_every_sizer() {
        let req = SizingRequest::new(dec!(100_000), dec!(50))
            .with_atr(dec!(2))
            .with_risk(snapshot(true));
        let mut kelly = KellySizer::new(dec!(0.5), dec!(0.25), 1);
        kelly.update_statistics(dec!(10));
        kelly.update_statistics(dec!(-5));

        assert_eq!(FixedFractionSizer::new(dec!(0.02), dec!(0.1)).size(&req), dec!(0));
        assert_eq!(kelly.size(&req), dec!(0));
        assert_eq!(AtrSizer::new(dec!(0.01), dec!(2), dec!(0.5)).size(&req), dec!(0));

        let open = req.clone().with_risk(snapshot(false));
        assert!(FixedFractionSizer::new(dec!(0.02), dec!(0.1)).size(&open) > dec!(0));
    }

    #[test]
    fn kelly_needs_min_trades() {
        let mut kelly = KellySizer::new(dec!(1), dec!(1), 5);
        for _ in 0..4 {
            kelly.update_statistics(dec!(100));
        }
        assert_eq!(kelly.kelly_fraction(), dec!(0));
        kelly.update_statistics(dec!(0)); // flat, not counted
        assert_eq!(kelly.statistics().trades(), 4);
    }

    #[test]
    fn kelly_fraction_formula() {
        // p = 0.6, b = 100/50 = 2 → f* = (2*0.6 - 0.4)/2 = 0.4; half Kelly = 0.2
        let mut kelly = KellySizer::new(dec!(0.5), dec!(1), 10);
        for _ in 0..6 {
            kelly.update_statistics(dec!(100));
        }
        for _ in 0..4 {
            kelly.update_statistics(dec!(-50));
        }
        assert_eq!(kelly.kelly_fraction(), dec!(0.2));

        let req = SizingRequest::new(dec!(10_000), dec!(20));
        assert_eq!(kelly.size(&req), dec!(100));
    }

    #[test]
    fn kelly_never_exceeds_cap() {
        let mut kelly = KellySizer::new(dec!(1), dec!(0.25), 2);
        for _ in 0..9 {
            kelly.update_statistics(dec!(500));
        }
        kelly.update_statistics(dec!(-1));
        assert_eq!(kelly.kelly_fraction(), dec!(0.25));

        // No losses at all
        let mut winners = KellySizer::new(dec!(1), dec!(0.25), 2);
        winners.update_statistics(dec!(1));
        winners.update_statistics(dec!(1));
        assert_eq!(winners.kelly_fraction(), dec!(0.25));
    }

    #[test]
    fn kelly_zero_payoff_and_negative_edge() {
        // b = 0: only losses
        let mut losers = KellySizer::new(dec!(1), dec!(0.25), 2);
        losers.update_statistics(dec!(-10));
        losers.update_statistics(dec!(-20));
        assert_eq!(losers.kelly_fraction(), dec!(0));

        // p = 0.3, b = 1 → negative edge clamps to zero
        let mut weak = KellySizer::new(dec!(1), dec!(0.25), 10);
        for _ in 0..3 {
            weak.update_statistics(dec!(10));
        }
        for _ in 0..7 {
            weak.update_statistics(dec!(-10));
        }
        assert_eq!(weak.kelly_fraction(), dec!(0));
        assert_eq!(weak.size(&SizingRequest::new(dec!(1000), dec!(10))), dec!(0));
    }

    #[test]
    fn atr_sizer_scales_with_volatility_and_caps() {
        let sizer = AtrSizer::new(dec!(0.01), dec!(2), dec!(0.5));
        // 1000 risk / (2.5 * 2) = 200 units; cap 100_000 * 0.5 / 100 = 500
        let req = SizingRequest::new(dec!(100_000), dec!(100)).with_atr(dec!(2.5));
        assert_eq!(sizer.size(&req), dec!(200));

        // Very low ATR hits the cap
        let calm = SizingRequest::new(dec!(100_000), dec!(100)).with_atr(dec!(0.5));
        assert_eq!(sizer.size(&calm), dec!(500));
    }
}
