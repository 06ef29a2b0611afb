//! Pre-trade admission control.
//!
//! Every candidate order passes through the account's pre-trade rules (its
//! own policy plus global rules) in canonical order. The first failing rule
//! short-circuits evaluation and becomes the single reason on the returned
//! [`GateDecision`]. A rule that cannot be evaluated is logged and skipped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, Utc};
use dashmap::DashMap;
use rp_types::{AccountState, OrderIntent, RuleEvaluationError, RuleGroup, RuleSpec};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::alerts::{RuleViolation, ViolationKind, ViolationSeverity};
use crate::circuit_breaker::CircuitBreakerBoard;
use crate::metrics::as_percent;
use crate::rules::Rule;
use crate::sink::ViolationSink;
use crate::store::RiskPolicyStore;

/// Outcome of a pre-trade check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    /// Empty when allowed; otherwise names exactly one triggering rule.
    pub reason: String,
    pub rule: Option<String>,
    pub kind: Option<ViolationKind>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
            rule: None,
            kind: None,
        }
    }

    pub fn deny(rule: &str, kind: ViolationKind, reason: String) -> Self {
        Self {
            allowed: false,
            reason,
            rule: Some(rule.to_string()),
            kind: Some(kind),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Pass/fail counters exposed by [`PreTradeGate::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub checks: u64,
    pub allowed: u64,
    pub denied: u64,
    /// Rules skipped because they could not be evaluated.
    pub rule_errors: u64,
    pub denials_by_rule: BTreeMap<String, u64>,
}

/// A failed rule: what kind of limit and why.
struct Denial {
    kind: ViolationKind,
    severity: ViolationSeverity,
    message: String,
}

impl Denial {
    fn warning(kind: ViolationKind, message: String) -> Self {
        Self {
            kind,
            severity: ViolationSeverity::Warning,
            message,
        }
    }
}

/// Realized losses recorded for one account on one local date.
#[derive(Debug, Clone, Copy)]
struct DailyLossLedger {
    date: NaiveDate,
    realized_loss: Decimal,
}

/// Everything a single rule needs to evaluate one order.
struct CheckContext<'a> {
    intent: &'a OrderIntent,
    account: &'a AccountState,
    accumulated_loss: Decimal,
}

/// Synchronous pre-trade gate. Never mutates the caller's account state and
/// never blocks on I/O.
#[derive(Debug)]
pub struct PreTradeGate {
    store: Arc<RiskPolicyStore>,
    breakers: Arc<CircuitBreakerBoard>,
    sink: ViolationSink,
    ledgers: DashMap<String, DailyLossLedger>,
    checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    rule_errors: AtomicU64,
    denials_by_rule: DashMap<String, u64>,
}

impl PreTradeGate {
    pub fn new(
        store: Arc<RiskPolicyStore>,
        breakers: Arc<CircuitBreakerBoard>,
        sink: ViolationSink,
    ) -> Self {
        Self {
            store,
            breakers,
            sink,
            ledgers: DashMap::new(),
            checks: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            rule_errors: AtomicU64::new(0),
            denials_by_rule: DashMap::new(),
        }
    }

    /// Check an order against the account's pre-trade rules.
    pub fn check(&self, intent: &OrderIntent, account: &AccountState) -> GateDecision {
        self.check_at(intent, account, Utc::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock, for backtests.
    pub fn check_at(
        &self,
        intent: &OrderIntent,
        account: &AccountState,
        now: DateTime<Utc>,
    ) -> GateDecision {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let account_id = account.account_id.as_str();
        if intent.account_id != account.account_id {
            warn!(
                intent_account = %intent.account_id,
                account_id,
                "order intent account differs from account snapshot; using snapshot"
            );
        }

        let ctx = CheckContext {
            intent,
            account,
            accumulated_loss: self.accumulated_loss(account, now),
        };

        for rule in self.store.rules_for(account_id, RuleGroup::PreTrade) {
            match self.evaluate(&rule, &ctx) {
                Ok(None) => {}
                Ok(Some(denial)) => return self.reject(&rule, denial, intent, account_id, now),
                Err(err) => {
                    self.rule_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        account_id,
                        rule = %rule.name,
                        error = %err,
                        "rule evaluation failed; treating as pass"
                    );
                }
            }
        }

        self.allowed.fetch_add(1, Ordering::Relaxed);
        debug!(
            account_id,
            symbol = %intent.symbol,
            side = ?intent.side,
            size = %intent.size,
            price = %intent.price,
            "order admitted"
        );
        GateDecision::allow()
    }

    fn reject(
        &self,
        rule: &Rule,
        denial: Denial,
        intent: &OrderIntent,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> GateDecision {
        self.denied.fetch_add(1, Ordering::Relaxed);
        *self.denials_by_rule.entry(rule.name.clone()).or_insert(0) += 1;

        warn!(
            account_id,
            rule = %rule.name,
            symbol = %intent.symbol,
            reason = %denial.message,
            "order denied"
        );
        self.sink.emit(RuleViolation::new(
            rule.name.clone(),
            denial.kind,
            account_id,
            denial.message.clone(),
            denial.severity,
            now,
        ));
        GateDecision::deny(&rule.name, denial.kind, denial.message)
    }

    fn evaluate(
        &self,
        rule: &Rule,
        ctx: &CheckContext<'_>,
    ) -> Result<Option<Denial>, RuleEvaluationError> {
        let CheckContext {
            intent,
            account,
            accumulated_loss,
        } = *ctx;

        match &rule.spec {
            RuleSpec::FundSufficiency => {
                let margin = notional(rule, intent)?;
                if margin > account.cash {
                    return Ok(Some(Denial::warning(
                        ViolationKind::InsufficientFunds,
                        format!(
                            "insufficient funds: required margin {margin} exceeds available cash {}",
                            account.cash
                        ),
                    )));
                }
            }
            RuleSpec::Leverage(p) => {
                if account.cash <= Decimal::ZERO {
                    return Ok(Some(Denial::warning(
                        ViolationKind::LeverageExceeded,
                        format!(
                            "leverage unbounded (cash {}) exceeds max {}x",
                            account.cash, p.max_leverage
                        ),
                    )));
                }
                let leverage = account
                    .portfolio_value
                    .checked_div(account.cash)
                    .ok_or_else(|| RuleEvaluationError::new(&rule.name, "leverage overflows"))?;
                if leverage >= p.max_leverage {
                    return Ok(Some(Denial::warning(
                        ViolationKind::LeverageExceeded,
                        format!(
                            "leverage {leverage:.2}x at or above max {}x",
                            p.max_leverage
                        ),
                    )));
                }
            }
            RuleSpec::Concentration(p) => {
                let pv = positive_portfolio_value(rule, account)?;
                let projected_size = account.position_size(&intent.symbol) + intent.signed_size();
                let projected_value = projected_size
                    .abs()
                    .checked_mul(intent.price)
                    .ok_or_else(|| {
                        RuleEvaluationError::new(&rule.name, "projected position value overflows")
                    })?;
                let concentration = ratio(rule, projected_value, pv, "position concentration")?;
                if concentration > p.max_concentration {
                    return Ok(Some(Denial::warning(
                        ViolationKind::ConcentrationExceeded,
                        format!(
                            "position concentration {:.2}% in {} exceeds max {:.2}%",
                            as_percent(concentration),
                            intent.symbol,
                            as_percent(p.max_concentration)
                        ),
                    )));
                }
            }
            RuleSpec::DailyLoss(p) => {
                let pv = positive_portfolio_value(rule, account)?;
                let estimated_loss = notional(rule, intent)?
                    .checked_mul(p.estimated_order_loss_pct)
                    .ok_or_else(|| {
                        RuleEvaluationError::new(&rule.name, "estimated order loss overflows")
                    })?;
                let projected = accumulated_loss.saturating_add(estimated_loss);
                let limit = p.max_daily_loss_pct * pv;
                if projected > limit {
                    return Ok(Some(Denial::warning(
                        ViolationKind::DailyLossExceeded,
                        format!(
                            "projected daily loss {projected:.2} (realized {accumulated_loss:.2} + estimated {estimated_loss:.2}) exceeds limit {limit:.2}"
                        ),
                    )));
                }
            }
            RuleSpec::OrderSize(p) => {
                let pv = positive_portfolio_value(rule, account)?;
                let ratio = ratio(rule, notional(rule, intent)?, pv, "order size ratio")?;
                if ratio > p.max_order_size_pct {
                    return Ok(Some(Denial::warning(
                        ViolationKind::OrderSizeExceeded,
                        format!(
                            "order size ratio {ratio:.4} exceeds max {} of portfolio value",
                            p.max_order_size_pct
                        ),
                    )));
                }
            }
            RuleSpec::MarketImpact(p) => {
                let pv = positive_portfolio_value(rule, account)?;
                let daily_volume = pv.checked_mul(p.daily_volume_multiple).ok_or_else(|| {
                    RuleEvaluationError::new(&rule.name, "assumed daily volume overflows")
                })?;
                let impact = ratio(rule, notional(rule, intent)?, daily_volume, "market impact")?;
                if impact > p.threshold_pct {
                    return Ok(Some(Denial::warning(
                        ViolationKind::MarketImpactExceeded,
                        format!(
                            "estimated market impact {:.3}% exceeds threshold {:.3}%",
                            as_percent(impact),
                            as_percent(p.threshold_pct)
                        ),
                    )));
                }
            }
            RuleSpec::CircuitBreakerHalt => {
                if self.breakers.is_tripped(&account.account_id) {
                    let cause = self
                        .breakers
                        .status(&account.account_id)
                        .map(|t| t.reason)
                        .unwrap_or_else(|| "unknown".to_string());
                    return Ok(Some(Denial {
                        kind: ViolationKind::CircuitBreakerActive,
                        severity: ViolationSeverity::Critical,
                        message: format!("circuit breaker active: {cause}"),
                    }));
                }
            }
            // Real-time rules never reach the gate.
            RuleSpec::CircuitBreaker(_)
            | RuleSpec::Var(_)
            | RuleSpec::Cvar(_)
            | RuleSpec::Drawdown(_)
            | RuleSpec::RiskBudget(_)
            | RuleSpec::StressTest(_) => {}
        }
        Ok(None)
    }

    /// Record a realized loss (positive amount) against today's ledger.
    pub fn record_realized_loss(&self, account_id: &str, loss: Decimal) {
        self.record_realized_loss_at(account_id, loss, Utc::now());
    }

    pub fn record_realized_loss_at(&self, account_id: &str, loss: Decimal, now: DateTime<Utc>) {
        if loss <= Decimal::ZERO {
            return;
        }
        let today = local_date(now);
        let mut ledger = self
            .ledgers
            .entry(account_id.to_string())
            .or_insert(DailyLossLedger {
                date: today,
                realized_loss: Decimal::ZERO,
            });
        if ledger.date != today {
            debug!(account_id, previous = %ledger.date, %today, "daily loss ledger rolled over");
            ledger.date = today;
            ledger.realized_loss = Decimal::ZERO;
        }
        ledger.realized_loss = ledger.realized_loss.saturating_add(loss);
    }

    /// Loss recorded in the gate's ledger for the local date of `now`.
    pub fn ledger_loss_at(&self, account_id: &str, now: DateTime<Utc>) -> Decimal {
        let today = local_date(now);
        self.ledgers
            .get(account_id)
            .filter(|l| l.date == today)
            .map(|l| l.realized_loss)
            .unwrap_or(Decimal::ZERO)
    }

    fn accumulated_loss(&self, account: &AccountState, now: DateTime<Utc>) -> Decimal {
        account
            .daily_realized_loss
            .max(self.ledger_loss_at(&account.account_id, now))
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            checks: self.checks.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            rule_errors: self.rule_errors.load(Ordering::Relaxed),
            denials_by_rule: self
                .denials_by_rule
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

fn local_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

fn notional(rule: &Rule, intent: &OrderIntent) -> Result<Decimal, RuleEvaluationError> {
    intent
        .size
        .checked_mul(intent.price)
        .map(|n| n.abs())
        .ok_or_else(|| RuleEvaluationError::new(&rule.name, "order notional overflows"))
}

fn ratio(
    rule: &Rule,
    numerator: Decimal,
    denominator: Decimal,
    what: &str,
) -> Result<Decimal, RuleEvaluationError> {
    numerator
        .checked_div(denominator)
        .ok_or_else(|| RuleEvaluationError::new(&rule.name, format!("{what} overflows")))
}

fn positive_portfolio_value(
    rule: &Rule,
    account: &AccountState,
) -> Result<Decimal, RuleEvaluationError> {
    if account.portfolio_value <= Decimal::ZERO {
        return Err(RuleEvaluationError::new(
            &rule.name,
            format!(
                "portfolio value must be positive, got {}",
                account.portfolio_value
            ),
        ));
    }
    Ok(account.portfolio_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerTrip;
    use chrono::TimeZone;
    use crossbeam_channel::{unbounded, Receiver};
    use rp_types::{CheckToggles, OrderSizeParams, RiskPolicy, Side};
    use rust_decimal_macros::dec;

    struct Harness {
        gate: PreTradeGate,
        store: Arc<RiskPolicyStore>,
        breakers: Arc<CircuitBreakerBoard>,
        rx: Receiver<RuleViolation>,
    }

    fn harness(policy: RiskPolicy) -> Harness {
        let store = Arc::new(RiskPolicyStore::new());
        store.install("acc-1", policy.clone()).unwrap();
        store.install("acc-2", policy).unwrap();
        let breakers = Arc::new(CircuitBreakerBoard::new());
        let (tx, rx) = unbounded();
        let gate = PreTradeGate::new(
            store.clone(),
            breakers.clone(),
            ViolationSink::from_sender(tx, usize::MAX),
        );
        Harness {
            gate,
            store,
            breakers,
            rx,
        }
    }

    fn buy(size: Decimal, price: Decimal) -> OrderIntent {
        OrderIntent::market("acc-1", "BTCUSDT", Side::Buy, size, price)
    }

    fn account(cash: Decimal, portfolio_value: Decimal) -> AccountState {
        AccountState::new("acc-1", cash, portfolio_value)
    }

    fn trip() -> BreakerTrip {
        BreakerTrip {
            reason: "tick return -12.00% below -10.00%".into(),
            tripped_at: Utc::now(),
            trigger_return: dec!(-0.12),
        }
    }

    #[test]
    fn small_order_is_admitted() {
        let h = harness(RiskPolicy::default());
        let decision = h.gate.check(&buy(dec!(1), dec!(500)), &account(dec!(10_000), dec!(10_000)));
        assert!(decision.is_allowed());
        assert!(decision.reason.is_empty());
        assert!(h.rx.try_recv().is_err());
    }

    #[test]
    fn fund_sufficiency_wins_over_leverage() {
        let policy = RiskPolicy::builder("p")
            .with_max_leverage(dec!(2.0))
            .build()
            .unwrap();
        let h = harness(policy);
        let decision = h
            .gate
            .check(&buy(dec!(1), dec!(15_000)), &account(dec!(10_000), dec!(10_000)));

        assert!(!decision.allowed);
        assert_eq!(decision.rule.as_deref(), Some("fund_sufficiency"));
        assert!(decision.reason.contains("insufficient funds"));
        assert!(decision.reason.contains("15000"));
    }

    #[test]
    fn leverage_at_or_above_max_is_denied() {
        let policy = RiskPolicy::builder("p")
            .with_max_leverage(dec!(2))
            .build()
            .unwrap();
        let h = harness(policy);

        for cash in [dec!(5_000), dec!(4_000), dec!(1_000)] {
            let decision = h.gate.check(&buy(dec!(1), dec!(100)), &account(cash, dec!(10_000)));
            assert!(!decision.allowed, "cash {cash} should be denied");
            assert_eq!(decision.kind, Some(ViolationKind::LeverageExceeded));
            assert!(decision.reason.contains("leverage"));
        }

        let decision = h
            .gate
            .check(&buy(dec!(1), dec!(100)), &account(dec!(5_001), dec!(10_000)));
        assert!(decision.allowed);
    }

    #[test]
    fn non_positive_cash_means_unbounded_leverage() {
        let checks = CheckToggles {
            fund_sufficiency: false,
            ..CheckToggles::default()
        };
        let policy = RiskPolicy::builder("p").with_checks(checks).build().unwrap();
        let h = harness(policy);
        let decision = h.gate.check(&buy(dec!(1), dec!(10)), &account(dec!(0), dec!(10_000)));
        assert_eq!(decision.rule.as_deref(), Some("leverage"));
        assert!(decision.reason.contains("unbounded"));
    }

    #[test]
    fn concentration_uses_projected_position() {
        let h = harness(RiskPolicy::default());
        let base = account(dec!(10_000), dec!(10_000)).with_position("BTCUSDT", dec!(20), dec!(90));

        // 25 * 100 / 10_000 = 25%: at the limit, allowed
        assert!(h.gate.check(&buy(dec!(5), dec!(100)), &base).allowed);

        // 26 * 100 / 10_000 = 26%: over the limit
        let decision = h.gate.check(&buy(dec!(6), dec!(100)), &base);
        assert_eq!(decision.rule.as_deref(), Some("concentration"));
        assert!(decision.reason.contains("BTCUSDT"));
    }

    #[test]
    fn reducing_an_oversized_position_is_allowed() {
        let h = harness(RiskPolicy::default());
        let base = account(dec!(7_000), dec!(10_000)).with_position("BTCUSDT", dec!(30), dec!(100));
        let sell = OrderIntent::market("acc-1", "BTCUSDT", Side::Sell, dec!(10), dec!(100));
        assert!(h.gate.check(&sell, &base).allowed);
    }

    #[test]
    fn daily_loss_projection_includes_estimated_order_loss() {
        let h = harness(RiskPolicy::default());
        // limit = 5% of 10_000 = 500; 450 + 10% of 600 = 510
        let acct = account(dec!(10_000), dec!(10_000)).with_daily_realized_loss(dec!(450));
        let decision = h.gate.check(&buy(dec!(6), dec!(100)), &acct);
        assert_eq!(decision.rule.as_deref(), Some("daily_loss"));

        // 450 + 10% of 400 = 490
        assert!(h.gate.check(&buy(dec!(4), dec!(100)), &acct).allowed);
    }

    #[test]
    fn daily_loss_ledger_resets_on_date_rollover() {
        let h = harness(RiskPolicy::default());
        let day1 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let day3 = Utc.with_ymd_and_hms(2024, 3, 3, 12, 0, 0).unwrap();
        h.gate.record_realized_loss_at("acc-1", dec!(480), day1);

        let acct = account(dec!(10_000), dec!(10_000));
        let order = buy(dec!(3), dec!(100)); // estimated loss 30
        let decision = h.gate.check_at(&order, &acct, day1);
        assert_eq!(decision.rule.as_deref(), Some("daily_loss"));

        assert!(h.gate.check_at(&order, &acct, day3).allowed);
        assert_eq!(h.gate.ledger_loss_at("acc-1", day3), dec!(0));

        h.gate.record_realized_loss_at("acc-1", dec!(100), day3);
        assert_eq!(h.gate.ledger_loss_at("acc-1", day3), dec!(100));
    }

    #[test]
    fn order_size_ratio_scenario() {
        let policy = RiskPolicy::builder("p")
            .with_max_order_size(dec!(0.10))
            .build()
            .unwrap();
        let h = harness(policy);
        let decision = h
            .gate
            .check(&buy(dec!(1), dec!(1_500)), &account(dec!(10_000), dec!(10_000)));

        assert!(!decision.allowed);
        assert_eq!(decision.kind, Some(ViolationKind::OrderSizeExceeded));
        assert!(decision.reason.contains("order size ratio 0.1500"));
    }

    #[test]
    fn market_impact_uses_assumed_daily_volume() {
        let checks = CheckToggles {
            order_size: false,
            ..CheckToggles::default()
        };
        let policy = RiskPolicy::builder("p").with_checks(checks).build().unwrap();
        let h = harness(policy);
        // 2_500 / (10 * 10_000) = 2.5% > 2%
        let decision = h
            .gate
            .check(&buy(dec!(25), dec!(100)), &account(dec!(10_000), dec!(10_000)));
        assert_eq!(decision.rule.as_deref(), Some("market_impact"));

        // 1_500 / 100_000 = 1.5%
        assert!(h
            .gate
            .check(&buy(dec!(15), dec!(100)), &account(dec!(10_000), dec!(10_000)))
            .allowed);
    }

    #[test]
    fn tripped_breaker_denies_and_emits_critical() {
        let h = harness(RiskPolicy::default());
        h.breakers.trip("acc-1", trip());

        let decision = h.gate.check(&buy(dec!(1), dec!(100)), &account(dec!(10_000), dec!(10_000)));
        assert_eq!(decision.kind, Some(ViolationKind::CircuitBreakerActive));
        assert!(decision.reason.starts_with("circuit breaker active"));

        let violation = h.rx.try_recv().expect("expected violation");
        assert_eq!(violation.severity, ViolationSeverity::Critical);
        assert_eq!(violation.account_id, "acc-1");
        assert_eq!(violation.rule_name, "circuit_breaker_halt");
    }

    #[test]
    fn breaker_on_one_account_does_not_affect_another() {
        let h = harness(RiskPolicy::default());
        h.breakers.trip("acc-1", trip());
        let other = AccountState::new("acc-2", dec!(10_000), dec!(10_000));
        let order = OrderIntent::market("acc-2", "BTCUSDT", Side::Buy, dec!(1), dec!(100));
        assert!(h.gate.check(&order, &other).allowed);
    }

    #[test]
    fn disabled_breaker_check_is_skipped() {
        let checks = CheckToggles {
            circuit_breaker: false,
            ..CheckToggles::default()
        };
        let h = harness(RiskPolicy::builder("p").with_checks(checks).build().unwrap());
        h.breakers.trip("acc-1", trip());
        assert!(h
            .gate
            .check(&buy(dec!(1), dec!(100)), &account(dec!(10_000), dec!(10_000)))
            .allowed);
    }

    #[test]
    fn rule_errors_are_non_blocking() {
        let h = harness(RiskPolicy::default());
        // Zero portfolio value: ratio-based rules cannot be evaluated
        let decision = h.gate.check(&buy(dec!(1), dec!(100)), &account(dec!(1_000), dec!(0)));
        assert!(decision.allowed);
        assert_eq!(h.gate.stats().rule_errors, 4);
    }

    #[test]
    fn ratio_overflow_is_a_rule_error() {
        let checks = CheckToggles {
            daily_loss: false,
            ..CheckToggles::default()
        };
        let h = harness(RiskPolicy::builder("p").with_checks(checks).build().unwrap());
        // 1_000_000 / 1e-28 does not fit in a Decimal
        let dust = account(dec!(1_000_000_000), Decimal::new(1, 28));
        let decision = h.gate.check(&buy(dec!(10), dec!(100_000)), &dust);
        assert!(decision.allowed);
        // concentration, order_size, market_impact
        assert_eq!(h.gate.stats().rule_errors, 3);

        let h = harness(RiskPolicy::default());
        let decision = h.gate.check(&buy(dec!(10), dec!(100_000)), &dust);
        assert_eq!(decision.rule.as_deref(), Some("daily_loss"));
        assert_eq!(h.gate.stats().rule_errors, 1);
    }

    #[test]
    fn global_rules_apply_to_every_account() {
        let h = harness(RiskPolicy::default());
        h.store
            .install_global_rule(Rule::new(
                "desk_order_size",
                RuleSpec::OrderSize(OrderSizeParams {
                    max_order_size_pct: dec!(0.05),
                }),
            ))
            .unwrap();

        let decision = h.gate.check(&buy(dec!(6), dec!(100)), &account(dec!(10_000), dec!(10_000)));
        assert_eq!(decision.rule.as_deref(), Some("desk_order_size"));

        let other = AccountState::new("acc-2", dec!(10_000), dec!(10_000));
        let order = OrderIntent::market("acc-2", "ETHUSDT", Side::Buy, dec!(6), dec!(100));
        assert_eq!(
            h.gate.check(&order, &other).rule.as_deref(),
            Some("desk_order_size")
        );
    }

    #[test]
    fn stats_count_decisions() {
        let h = harness(RiskPolicy::default());
        let acct = account(dec!(10_000), dec!(10_000));
        h.gate.check(&buy(dec!(1), dec!(100)), &acct);
        h.gate.check(&buy(dec!(1), dec!(20_000)), &acct);
        h.gate.check(&buy(dec!(1), dec!(30_000)), &acct);

        let stats = h.gate.stats();
        assert_eq!(stats.checks, 3);
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.denied, 2);
        assert_eq!(stats.denials_by_rule.get("fund_sufficiency"), Some(&2));
        assert_eq!(h.rx.try_iter().count(), 2);
    }

    #[test]
    fn gate_never_mutates_account() {
        let h = harness(RiskPolicy::default());
        let acct = account(dec!(10_000), dec!(10_000)).with_position("BTCUSDT", dec!(1), dec!(100));
        let before = acct.clone();
        h.gate.check(&buy(dec!(1), dec!(100)), &acct);
        h.gate.check(&buy(dec!(100), dec!(100)), &acct);
        assert_eq!(acct, before);
    }
}
