//! Rule violation events and severity levels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Severity of a rule violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Informational only.
    Info,
    /// A limit was hit and the affected action was blocked.
    Warning,
    /// Protective action taken, e.g. a circuit breaker tripped.
    Critical,
}

/// What kind of limit produced the violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    InsufficientFunds,
    LeverageExceeded,
    ConcentrationExceeded,
    DailyLossExceeded,
    OrderSizeExceeded,
    MarketImpactExceeded,
    CircuitBreakerActive,
    CircuitBreakerTriggered,
    VarLimit,
    CvarLimit,
    DrawdownLimit,
    RiskBudget,
    SevereStressTest,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ViolationKind::LeverageExceeded => "LEVERAGE_EXCEEDED",
            ViolationKind::ConcentrationExceeded => "CONCENTRATION_EXCEEDED",
            ViolationKind::DailyLossExceeded => "DAILY_LOSS_EXCEEDED",
            ViolationKind::OrderSizeExceeded => "ORDER_SIZE_EXCEEDED",
            ViolationKind::MarketImpactExceeded => "MARKET_IMPACT_EXCEEDED",
            ViolationKind::CircuitBreakerActive => "CIRCUIT_BREAKER_ACTIVE",
            ViolationKind::CircuitBreakerTriggered => "CIRCUIT_BREAKER_TRIGGERED",
            ViolationKind::VarLimit => "VAR_LIMIT",
            ViolationKind::CvarLimit => "CVAR_LIMIT",
            ViolationKind::DrawdownLimit => "DRAWDOWN_LIMIT",
            ViolationKind::RiskBudget => "RISK_BUDGET",
            ViolationKind::SevereStressTest => "SEVERE_STRESS_TEST",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single violation emitted by the gate or the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub id: Uuid,
    pub rule_name: String,
    pub kind: ViolationKind,
    pub account_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: ViolationSeverity,
}

impl RuleViolation {
    pub fn new(
        rule_name: impl Into<String>,
        kind: ViolationKind,
        account_id: impl Into<String>,
        message: String,
        severity: ViolationSeverity,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_name: rule_name.into(),
            kind,
            account_id: account_id.into(),
            message,
            timestamp,
            severity,
        }
    }
}
