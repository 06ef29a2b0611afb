//! Risk policies and the typed rule specifications they compile into.
//!
//! A [`RiskPolicy`] is the flat, serializable threshold set a configuration
//! loader hands to the engine. [`RiskPolicy::rule_specs`] turns it into the
//! ordered list of [`RuleSpec`]s that the gate and the monitor evaluate.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{ConfigValidationError, FieldViolation, RiskResult};

/// Minimum number of return samples before window statistics are trusted.
pub const MIN_RISK_SAMPLES: usize = 30;

/// Which evaluation path a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleGroup {
    /// Evaluated synchronously by the pre-trade gate on every order.
    PreTrade,
    /// Evaluated by the continuous monitor on every tick.
    RealTime,
}

impl RuleGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleGroup::PreTrade => "pre_trade",
            RuleGroup::RealTime => "real_time",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeverageParams {
    pub max_leverage: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationParams {
    pub max_concentration: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyLossParams {
    pub max_daily_loss_pct: Decimal,
    /// Fraction of order notional assumed lost in the worst case.
    pub estimated_order_loss_pct: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderSizeParams {
    pub max_order_size_pct: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketImpactParams {
    pub threshold_pct: Decimal,
    /// Assumed daily volume as a multiple of portfolio value.
    pub daily_volume_multiple: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerParams {
    /// Single-tick loss (as a positive fraction) that trips the breaker.
    pub threshold_pct: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TailRiskParams {
    pub confidence: Decimal,
    pub limit_pct: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawdownParams {
    pub max_drawdown_pct: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskBudgetParams {
    pub budget_pct: Decimal,
    pub confidence: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressTestParams {
    pub scenarios: BTreeMap<String, Decimal>,
    pub severe_loss_pct: Decimal,
}

/// Tagged rule specification. Each kind carries its own parameter struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSpec {
    FundSufficiency,
    Leverage(LeverageParams),
    Concentration(ConcentrationParams),
    DailyLoss(DailyLossParams),
    OrderSize(OrderSizeParams),
    MarketImpact(MarketImpactParams),
    /// Pre-trade halt while the account's circuit breaker is tripped.
    CircuitBreakerHalt,
    /// Real-time trip condition for the circuit breaker.
    CircuitBreaker(CircuitBreakerParams),
    Var(TailRiskParams),
    Cvar(TailRiskParams),
    Drawdown(DrawdownParams),
    RiskBudget(RiskBudgetParams),
    StressTest(StressTestParams),
}

impl RuleSpec {
    pub fn group(&self) -> RuleGroup {
        match self {
            RuleSpec::FundSufficiency
            | RuleSpec::Leverage(_)
            | RuleSpec::Concentration(_)
            | RuleSpec::DailyLoss(_)
            | RuleSpec::OrderSize(_)
            | RuleSpec::MarketImpact(_)
            | RuleSpec::CircuitBreakerHalt => RuleGroup::PreTrade,
            RuleSpec::CircuitBreaker(_)
            | RuleSpec::Var(_)
            | RuleSpec::Cvar(_)
            | RuleSpec::Drawdown(_)
            | RuleSpec::RiskBudget(_)
            | RuleSpec::StressTest(_) => RuleGroup::RealTime,
        }
    }

    /// Canonical evaluation position within the rule's group.
    pub fn order(&self) -> u8 {
        match self {
            RuleSpec::FundSufficiency => 1,
            RuleSpec::Leverage(_) => 2,
            RuleSpec::Concentration(_) => 3,
            RuleSpec::DailyLoss(_) => 4,
            RuleSpec::OrderSize(_) => 5,
            RuleSpec::MarketImpact(_) => 6,
            RuleSpec::CircuitBreakerHalt => 7,
            RuleSpec::CircuitBreaker(_) => 1,
            RuleSpec::Var(_) => 2,
            RuleSpec::Cvar(_) => 3,
            RuleSpec::Drawdown(_) => 4,
            RuleSpec::RiskBudget(_) => 5,
            RuleSpec::StressTest(_) => 6,
        }
    }

    /// Stable identifier of the rule kind, used as the default rule name.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RuleSpec::FundSufficiency => "fund_sufficiency",
            RuleSpec::Leverage(_) => "leverage",
            RuleSpec::Concentration(_) => "concentration",
            RuleSpec::DailyLoss(_) => "daily_loss",
            RuleSpec::OrderSize(_) => "order_size",
            RuleSpec::MarketImpact(_) => "market_impact",
            RuleSpec::CircuitBreakerHalt => "circuit_breaker_halt",
            RuleSpec::CircuitBreaker(_) => "circuit_breaker",
            RuleSpec::Var(_) => "var",
            RuleSpec::Cvar(_) => "cvar",
            RuleSpec::Drawdown(_) => "drawdown",
            RuleSpec::RiskBudget(_) => "risk_budget",
            RuleSpec::StressTest(_) => "stress_test",
        }
    }

    /// Append every invalid parameter to `out`, prefixing field names with
    /// `prefix`.
    pub fn validate_into(&self, prefix: &str, out: &mut Vec<FieldViolation>) {
        let field = |name: &str| format!("{prefix}{name}");
        match self {
            RuleSpec::FundSufficiency | RuleSpec::CircuitBreakerHalt => {}
            RuleSpec::Leverage(p) => positive(&field("maxLeverage"), p.max_leverage, out),
            RuleSpec::Concentration(p) => {
                fraction(&field("maxConcentration"), p.max_concentration, out)
            }
            RuleSpec::DailyLoss(p) => {
                fraction(&field("maxDailyLossPct"), p.max_daily_loss_pct, out);
                fraction(&field("estimatedOrderLossPct"), p.estimated_order_loss_pct, out);
            }
            RuleSpec::OrderSize(p) => fraction(&field("maxOrderSizePct"), p.max_order_size_pct, out),
            RuleSpec::MarketImpact(p) => {
                fraction(&field("thresholdPct"), p.threshold_pct, out);
                positive(&field("dailyVolumeMultiple"), p.daily_volume_multiple, out);
            }
            RuleSpec::CircuitBreaker(p) => {
                fraction(&field("thresholdPct"), p.threshold_pct, out);
                positive(&field("thresholdPct"), p.threshold_pct, out);
            }
            RuleSpec::Var(p) | RuleSpec::Cvar(p) => {
                confidence(&field("confidence"), p.confidence, out);
                fraction(&field("limitPct"), p.limit_pct, out);
            }
            RuleSpec::Drawdown(p) => fraction(&field("maxDrawdownPct"), p.max_drawdown_pct, out),
            RuleSpec::RiskBudget(p) => {
                fraction(&field("budgetPct"), p.budget_pct, out);
                positive(&field("budgetPct"), p.budget_pct, out);
                confidence(&field("confidence"), p.confidence, out);
            }
            RuleSpec::StressTest(p) => {
                fraction(&field("severeLossPct"), p.severe_loss_pct, out);
                for (name, shock) in &p.scenarios {
                    if *shock < -Decimal::ONE {
                        out.push(FieldViolation::new(
                            field(&format!("scenarios.{name}")),
                            format!("shock must be >= -1, got {shock}"),
                        ));
                    }
                }
            }
        }
    }
}

fn fraction(field: &str, value: Decimal, out: &mut Vec<FieldViolation>) {
    if value < Decimal::ZERO || value > Decimal::ONE {
        out.push(FieldViolation::new(
            field,
            format!("must be within [0, 1], got {value}"),
        ));
    }
}

fn positive(field: &str, value: Decimal, out: &mut Vec<FieldViolation>) {
    if value <= Decimal::ZERO {
        out.push(FieldViolation::new(field, format!("must be > 0, got {value}")));
    }
}

fn confidence(field: &str, value: Decimal, out: &mut Vec<FieldViolation>) {
    if value <= Decimal::ZERO || value >= Decimal::ONE {
        out.push(FieldViolation::new(
            field,
            format!("must be within (0, 1), got {value}"),
        ));
    }
}

/// Per-check enable flags for the pre-trade gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckToggles {
    pub fund_sufficiency: bool,
    pub leverage: bool,
    pub concentration: bool,
    pub daily_loss: bool,
    pub order_size: bool,
    pub market_impact: bool,
    pub circuit_breaker: bool,
}

impl Default for CheckToggles {
    fn default() -> Self {
        Self {
            fund_sufficiency: true,
            leverage: true,
            concentration: true,
            daily_loss: true,
            order_size: true,
            market_impact: true,
            circuit_breaker: true,
        }
    }
}

/// Named set of risk thresholds for one account.
///
/// Percentages are fractions (`0.05` = 5%). Field names serialize in
/// camelCase so policies can be loaded straight from JSON configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RiskPolicy {
    pub name: String,
    pub max_leverage: Decimal,
    pub max_position_concentration: Decimal,
    pub max_daily_loss_pct: Decimal,
    pub max_order_size_pct: Decimal,
    pub market_impact_threshold_pct: Decimal,
    pub max_drawdown_pct: Decimal,
    pub risk_budget_pct: Decimal,
    pub var_confidence: Decimal,
    pub cvar_confidence: Decimal,
    pub var_limit_pct: Decimal,
    pub cvar_limit_pct: Decimal,
    pub circuit_breaker_threshold: Decimal,
    pub stress_scenarios: BTreeMap<String, Decimal>,
    pub severe_stress_loss_pct: Decimal,
    pub estimated_order_loss_pct: Decimal,
    pub daily_volume_multiple: Decimal,
    pub return_window: usize,
    pub violation_cooldown_secs: u64,
    pub checks: CheckToggles,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        let mut stress_scenarios = BTreeMap::new();
        stress_scenarios.insert("market_crash".to_string(), Decimal::new(-20, 2));
        stress_scenarios.insert("flash_crash".to_string(), Decimal::new(-10, 2));
        stress_scenarios.insert("volatility_spike".to_string(), Decimal::new(-5, 2));

        Self {
            name: "default".to_string(),
            max_leverage: Decimal::from(3),
            max_position_concentration: Decimal::new(25, 2), // 25%
            max_daily_loss_pct: Decimal::new(5, 2),          // 5%
            max_order_size_pct: Decimal::new(10, 2),         // 10%
            market_impact_threshold_pct: Decimal::new(2, 2), // 2%
            max_drawdown_pct: Decimal::new(20, 2),           // 20%
            risk_budget_pct: Decimal::new(5, 2),             // 5%
            var_confidence: Decimal::new(95, 2),
            cvar_confidence: Decimal::new(95, 2),
            var_limit_pct: Decimal::new(5, 2),
            cvar_limit_pct: Decimal::new(8, 2),
            circuit_breaker_threshold: Decimal::new(10, 2), // 10% single-tick loss
            stress_scenarios,
            severe_stress_loss_pct: Decimal::new(25, 2),
            estimated_order_loss_pct: Decimal::new(10, 2),
            daily_volume_multiple: Decimal::from(10),
            return_window: 252,
            violation_cooldown_secs: 300,
            checks: CheckToggles::default(),
        }
    }
}

impl RiskPolicy {
    /// Start building a policy from the defaults.
    pub fn builder(name: impl Into<String>) -> RiskPolicyBuilder {
        RiskPolicyBuilder::new(name)
    }

    /// Parse a policy from JSON and validate it.
    pub fn from_json(json: &str) -> RiskResult<Self> {
        let policy: RiskPolicy = serde_json::from_str(json)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Check every field, collecting all violations.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut violations = Vec::new();

        positive("maxLeverage", self.max_leverage, &mut violations);
        for (field, value) in [
            ("maxPositionConcentration", self.max_position_concentration),
            ("maxDailyLossPct", self.max_daily_loss_pct),
            ("maxOrderSizePct", self.max_order_size_pct),
            ("marketImpactThresholdPct", self.market_impact_threshold_pct),
            ("maxDrawdownPct", self.max_drawdown_pct),
            ("riskBudgetPct", self.risk_budget_pct),
            ("varLimitPct", self.var_limit_pct),
            ("cvarLimitPct", self.cvar_limit_pct),
            ("circuitBreakerThreshold", self.circuit_breaker_threshold),
            ("severeStressLossPct", self.severe_stress_loss_pct),
            ("estimatedOrderLossPct", self.estimated_order_loss_pct),
        ] {
            fraction(field, value, &mut violations);
        }
        positive("riskBudgetPct", self.risk_budget_pct, &mut violations);
        positive("circuitBreakerThreshold", self.circuit_breaker_threshold, &mut violations);
        positive("dailyVolumeMultiple", self.daily_volume_multiple, &mut violations);
        confidence("varConfidence", self.var_confidence, &mut violations);
        confidence("cvarConfidence", self.cvar_confidence, &mut violations);

        for (name, shock) in &self.stress_scenarios {
            if *shock < -Decimal::ONE {
                violations.push(FieldViolation::new(
                    format!("stressScenarios.{name}"),
                    format!("shock must be >= -1, got {shock}"),
                ));
            }
        }

        if self.return_window < MIN_RISK_SAMPLES {
            violations.push(FieldViolation::new(
                "returnWindow",
                format!(
                    "must be at least {MIN_RISK_SAMPLES}, got {}",
                    self.return_window
                ),
            ));
        }
        if self.name.trim().is_empty() {
            violations.push(FieldViolation::new("name", "must not be empty"));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigValidationError::new(self.name.clone(), violations))
        }
    }

    /// Compile the policy into its rule set, pre-trade rules first, each
    /// group in canonical order. Disabled pre-trade checks are omitted.
    pub fn rule_specs(&self) -> Vec<RuleSpec> {
        let mut specs = Vec::new();
        let checks = &self.checks;

        if checks.fund_sufficiency {
            specs.push(RuleSpec::FundSufficiency);
        }
        if checks.leverage {
            specs.push(RuleSpec::Leverage(LeverageParams {
                max_leverage: self.max_leverage,
            }));
        }
        if checks.concentration {
            specs.push(RuleSpec::Concentration(ConcentrationParams {
                max_concentration: self.max_position_concentration,
            }));
        }
        if checks.daily_loss {
            specs.push(RuleSpec::DailyLoss(DailyLossParams {
                max_daily_loss_pct: self.max_daily_loss_pct,
                estimated_order_loss_pct: self.estimated_order_loss_pct,
            }));
        }
        if checks.order_size {
            specs.push(RuleSpec::OrderSize(OrderSizeParams {
                max_order_size_pct: self.max_order_size_pct,
            }));
        }
        if checks.market_impact {
            specs.push(RuleSpec::MarketImpact(MarketImpactParams {
                threshold_pct: self.market_impact_threshold_pct,
                daily_volume_multiple: self.daily_volume_multiple,
            }));
        }
        if checks.circuit_breaker {
            specs.push(RuleSpec::CircuitBreakerHalt);
        }

        specs.push(RuleSpec::CircuitBreaker(CircuitBreakerParams {
            threshold_pct: self.circuit_breaker_threshold,
        }));
        specs.push(RuleSpec::Var(TailRiskParams {
            confidence: self.var_confidence,
            limit_pct: self.var_limit_pct,
        }));
        specs.push(RuleSpec::Cvar(TailRiskParams {
            confidence: self.cvar_confidence,
            limit_pct: self.cvar_limit_pct,
        }));
        specs.push(RuleSpec::Drawdown(DrawdownParams {
            max_drawdown_pct: self.max_drawdown_pct,
        }));
        specs.push(RuleSpec::RiskBudget(RiskBudgetParams {
            budget_pct: self.risk_budget_pct,
            confidence: self.var_confidence,
        }));
        if !self.stress_scenarios.is_empty() {
            specs.push(RuleSpec::StressTest(StressTestParams {
                scenarios: self.stress_scenarios.clone(),
                severe_loss_pct: self.severe_stress_loss_pct,
            }));
        }

        specs
    }
}

/// Fluent constructor for [`RiskPolicy`]. `build` validates.
#[derive(Debug, Clone)]
pub struct RiskPolicyBuilder {
    policy: RiskPolicy,
}

impl RiskPolicyBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            policy: RiskPolicy {
                name: name.into(),
                ..RiskPolicy::default()
            },
        }
    }

    pub fn with_max_leverage(mut self, max_leverage: Decimal) -> Self {
        self.policy.max_leverage = max_leverage;
        self
    }

    pub fn with_concentration(mut self, max_concentration: Decimal) -> Self {
        self.policy.max_position_concentration = max_concentration;
        self
    }

    pub fn with_max_daily_loss(mut self, pct: Decimal) -> Self {
        self.policy.max_daily_loss_pct = pct;
        self
    }

    pub fn with_max_order_size(mut self, pct: Decimal) -> Self {
        self.policy.max_order_size_pct = pct;
        self
    }

    pub fn with_market_impact_threshold(mut self, pct: Decimal) -> Self {
        self.policy.market_impact_threshold_pct = pct;
        self
    }

    pub fn with_max_drawdown(mut self, pct: Decimal) -> Self {
        self.policy.max_drawdown_pct = pct;
        self
    }

    pub fn with_risk_budget(mut self, pct: Decimal) -> Self {
        self.policy.risk_budget_pct = pct;
        self
    }

    pub fn with_var(mut self, confidence: Decimal, limit_pct: Decimal) -> Self {
        self.policy.var_confidence = confidence;
        self.policy.var_limit_pct = limit_pct;
        self
    }

    pub fn with_cvar(mut self, confidence: Decimal, limit_pct: Decimal) -> Self {
        self.policy.cvar_confidence = confidence;
        self.policy.cvar_limit_pct = limit_pct;
        self
    }

    pub fn with_circuit_breaker(mut self, threshold: Decimal) -> Self {
        self.policy.circuit_breaker_threshold = threshold;
        self
    }

    pub fn with_stress_scenario(mut self, name: impl Into<String>, shock_pct: Decimal) -> Self {
        self.policy.stress_scenarios.insert(name.into(), shock_pct);
        self
    }

    pub fn without_stress_scenarios(mut self) -> Self {
        self.policy.stress_scenarios.clear();
        self
    }

    pub fn with_severe_stress_loss(mut self, pct: Decimal) -> Self {
        self.policy.severe_stress_loss_pct = pct;
        self
    }

    pub fn with_estimated_order_loss(mut self, pct: Decimal) -> Self {
        self.policy.estimated_order_loss_pct = pct;
        self
    }

    pub fn with_daily_volume_multiple(mut self, multiple: Decimal) -> Self {
        self.policy.daily_volume_multiple = multiple;
        self
    }

    pub fn with_return_window(mut self, samples: usize) -> Self {
        self.policy.return_window = samples;
        self
    }

    pub fn with_violation_cooldown_secs(mut self, secs: u64) -> Self {
        self.policy.violation_cooldown_secs = secs;
        self
    }

    pub fn with_checks(mut self, checks: CheckToggles) -> Self {
        self.policy.checks = checks;
        self
    }

    pub fn build(self) -> Result<RiskPolicy, ConfigValidationError> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}
