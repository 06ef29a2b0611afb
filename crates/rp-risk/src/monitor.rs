//! Continuous risk monitor: per-tick metric evaluation with violation emission.
//!
//! Call [`ContinuousRiskMonitor::update`] once per account per tick. Each
//! account keeps a bounded window of tick returns and an all-time high-water
//! mark behind its own lock; the monitor recomputes VaR, CVaR, drawdown,
//! volatility and stress losses, evaluates the account's real-time rules and
//! publishes a fresh [`RiskSnapshot`].
//!
//! Circuit breaker trips go to the shared [`CircuitBreakerBoard`] so the
//! pre-trade gate sees them on the next order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use rp_types::{AccountState, RiskPolicy, RuleGroup, RuleSpec, MIN_RISK_SAMPLES};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::{RuleViolation, ViolationKind, ViolationSeverity};
use crate::circuit_breaker::{BreakerTrip, CircuitBreakerBoard};
use crate::metrics::{as_percent, RiskMetricsCalculator, RiskSnapshot, StressResult};
use crate::rules::{Rule, RuleState};
use crate::sink::ViolationSink;
use crate::store::RiskPolicyStore;

#[derive(Debug, Default)]
struct AccountMonitorState {
    returns: VecDeque<Decimal>,
    last_value: Option<Decimal>,
    peak: Option<Decimal>,
    max_drawdown: Decimal,
    /// Keyed by rule name; stress scenarios use `rule:scenario`.
    rule_states: HashMap<String, RuleState>,
    latest: Option<Arc<RiskSnapshot>>,
}

impl AccountMonitorState {
    /// Fold one equity observation into the window and the high-water mark.
    /// Returns the tick return, if a previous positive value exists.
    fn observe(&mut self, value: Decimal, window: usize) -> Option<Decimal> {
        let tick_return = match self.last_value {
            Some(prev) if prev > Decimal::ZERO => {
                let r = value.checked_sub(prev).and_then(|delta| delta.checked_div(prev));
                if r.is_none() {
                    debug!(%prev, %value, "tick return out of range, not recorded");
                }
                r
            }
            _ => None,
        };
        if let Some(r) = tick_return {
            self.returns.push_back(r);
            while self.returns.len() > window {
                self.returns.pop_front();
            }
        }
        self.last_value = Some(value);

        let peak = self.peak.map_or(value, |p| p.max(value));
        self.peak = Some(peak);
        let drawdown = RiskMetricsCalculator::drawdown(peak, value);
        self.max_drawdown = self.max_drawdown.max(drawdown);

        tick_return
    }

    fn drawdown(&self) -> Decimal {
        match (self.peak, self.last_value) {
            (Some(peak), Some(value)) => RiskMetricsCalculator::drawdown(peak, value),
            _ => Decimal::ZERO,
        }
    }
}

/// Window statistics for one tick, shared by every rule evaluated on it.
struct TickView<'a> {
    account_id: &'a str,
    now: DateTime<Utc>,
    window: &'a [Decimal],
    tick_return: Option<Decimal>,
    drawdown: Decimal,
    value: Decimal,
}

impl TickView<'_> {
    fn sufficient(&self) -> bool {
        self.window.len() >= MIN_RISK_SAMPLES
    }
}

/// Real-time risk monitor shared across accounts.
#[derive(Debug)]
pub struct ContinuousRiskMonitor {
    store: Arc<RiskPolicyStore>,
    breakers: Arc<CircuitBreakerBoard>,
    sink: ViolationSink,
    accounts: DashMap<String, Arc<Mutex<AccountMonitorState>>>,
}

impl ContinuousRiskMonitor {
    pub fn new(
        store: Arc<RiskPolicyStore>,
        breakers: Arc<CircuitBreakerBoard>,
        sink: ViolationSink,
    ) -> Self {
        Self {
            store,
            breakers,
            sink,
            accounts: DashMap::new(),
        }
    }

    /// Evaluate one tick for `account`.
    pub fn update(&self, account: &AccountState) -> RiskSnapshot {
        self.update_at(account, Utc::now())
    }

    /// Same as [`update`](Self::update) with an explicit clock.
    pub fn update_at(&self, account: &AccountState, now: DateTime<Utc>) -> RiskSnapshot {
        let account_id = account.account_id.as_str();
        let (policy, rules) = self.store.resolve(account_id, RuleGroup::RealTime);

        let state = self.state_for(account_id);
        let mut state = state.lock();

        let value = account.portfolio_value;
        let tick_return = state.observe(value, policy.return_window);
        let window: Vec<Decimal> = state.returns.iter().copied().collect();
        let view = TickView {
            account_id,
            now,
            window: &window,
            tick_return,
            drawdown: state.drawdown(),
            value,
        };

        for rule in &rules {
            self.evaluate_rule(rule, &view, &mut state.rule_states);
        }

        let snapshot = self.build_snapshot(&policy, &view, state.max_drawdown);
        debug!(
            account_id,
            var = %snapshot.var,
            drawdown = %snapshot.drawdown,
            samples = snapshot.sample_count,
            "risk snapshot published"
        );
        state.latest = Some(Arc::new(snapshot.clone()));
        snapshot
    }

    /// Evaluate many accounts in parallel. Each account still serializes on
    /// its own lock.
    pub fn update_batch(&self, accounts: &[AccountState]) -> Vec<RiskSnapshot> {
        let now = Utc::now();
        accounts
            .par_iter()
            .map(|account| self.update_at(account, now))
            .collect()
    }

    /// Warm the return window from historical equity values, oldest first.
    /// No rules are evaluated and no snapshot is published.
    pub fn seed_history(&self, account_id: &str, values: &[Decimal]) {
        let window = self.store.effective_policy(account_id).return_window;
        let state = self.state_for(account_id);
        let mut state = state.lock();
        for value in values {
            state.observe(*value, window);
        }
        info!(
            account_id,
            seeded = values.len(),
            samples = state.returns.len(),
            "return history seeded"
        );
    }

    /// Clear the account's circuit breaker and rule counters. The return
    /// window and high-water mark are kept.
    pub fn reset(&self, account_id: &str) {
        let state = self.state_for(account_id);
        let mut state = state.lock();

        let was_tripped = self.breakers.reset(account_id);
        for rule_state in state.rule_states.values_mut() {
            rule_state.reset();
        }
        if let Some(latest) = state.latest.take() {
            let mut cleared = (*latest).clone();
            cleared.circuit_breaker_triggered = false;
            state.latest = Some(Arc::new(cleared));
        }
        info!(account_id, was_tripped, "risk monitor state reset");
    }

    /// Last published snapshot for the account.
    pub fn latest(&self, account_id: &str) -> Option<Arc<RiskSnapshot>> {
        let state = self.accounts.get(account_id)?.value().clone();
        let latest = state.lock().latest.clone();
        latest
    }

    pub fn rule_state(&self, account_id: &str, rule: &str) -> Option<RuleState> {
        let state = self.accounts.get(account_id)?.value().clone();
        let found = state.lock().rule_states.get(rule).cloned();
        found
    }

    fn state_for(&self, account_id: &str) -> Arc<Mutex<AccountMonitorState>> {
        self.accounts
            .entry(account_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn evaluate_rule(
        &self,
        rule: &Rule,
        view: &TickView<'_>,
        states: &mut HashMap<String, RuleState>,
    ) {
        match &rule.spec {
            RuleSpec::CircuitBreaker(p) => {
                let Some(r) = view.tick_return else { return };
                if r >= -p.threshold_pct {
                    return;
                }
                let reason = format!(
                    "tick return {:.2}% below -{:.2}%",
                    as_percent(r),
                    as_percent(p.threshold_pct)
                );
                states
                    .entry(rule.name.clone())
                    .or_default()
                    .record_breach(view.now, chrono::Duration::zero());
                let newly_tripped = self.breakers.trip(
                    view.account_id,
                    BreakerTrip {
                        reason: reason.clone(),
                        tripped_at: view.now,
                        trigger_return: r,
                    },
                );
                if newly_tripped {
                    self.sink.emit(RuleViolation::new(
                        &rule.name,
                        ViolationKind::CircuitBreakerTriggered,
                        view.account_id,
                        reason,
                        ViolationSeverity::Critical,
                        view.now,
                    ));
                }
            }
            RuleSpec::Var(p) => {
                if let Some(var) = self.windowed(rule, view, |w| {
                    RiskMetricsCalculator::var(w, p.confidence)
                }) {
                    if var > p.limit_pct {
                        let message = format!(
                            "VaR({}) {:.2}% exceeds limit {:.2}%",
                            p.confidence,
                            as_percent(var),
                            as_percent(p.limit_pct)
                        );
                        self.breach(rule, ViolationKind::VarLimit, &rule.name, message, view, states);
                    }
                }
            }
            RuleSpec::Cvar(p) => {
                if let Some(cvar) = self.windowed(rule, view, |w| {
                    RiskMetricsCalculator::cvar(w, p.confidence)
                }) {
                    if cvar > p.limit_pct {
                        let message = format!(
                            "CVaR({}) {:.2}% exceeds limit {:.2}%",
                            p.confidence,
                            as_percent(cvar),
                            as_percent(p.limit_pct)
                        );
                        self.breach(rule, ViolationKind::CvarLimit, &rule.name, message, view, states);
                    }
                }
            }
            RuleSpec::Drawdown(p) => {
                if view.drawdown > p.max_drawdown_pct {
                    let message = format!(
                        "drawdown {:.2}% exceeds max {:.2}%",
                        as_percent(view.drawdown),
                        as_percent(p.max_drawdown_pct)
                    );
                    self.breach(rule, ViolationKind::DrawdownLimit, &rule.name, message, view, states);
                }
            }
            RuleSpec::RiskBudget(p) => {
                if let Some(var) = self.windowed(rule, view, |w| {
                    RiskMetricsCalculator::var(w, p.confidence)
                }) {
                    let used = var.checked_div(p.budget_pct).unwrap_or(Decimal::MAX);
                    if used > Decimal::ONE {
                        let message = format!(
                            "risk budget {:.0}% used (VaR {:.2}% vs budget {:.2}%)",
                            as_percent(used),
                            as_percent(var),
                            as_percent(p.budget_pct)
                        );
                        self.breach(rule, ViolationKind::RiskBudget, &rule.name, message, view, states);
                    }
                }
            }
            RuleSpec::StressTest(p) => {
                let results =
                    RiskMetricsCalculator::stress(view.value, &p.scenarios, p.severe_loss_pct);
                for result in results.iter().filter(|r| r.severe) {
                    let message = format!(
                        "stress scenario '{}' ({:.0}% shock) implies {:.2}% loss",
                        result.scenario,
                        as_percent(result.shock_pct),
                        as_percent(result.loss_pct)
                    );
                    let key = format!("{}:{}", rule.name, result.scenario);
                    self.breach(rule, ViolationKind::SevereStressTest, &key, message, view, states);
                }
            }
            // Pre-trade kinds never reach the real-time group.
            _ => {}
        }
    }

    /// Run a window statistic, skipping the rule when data is insufficient.
    fn windowed<F>(&self, rule: &Rule, view: &TickView<'_>, f: F) -> Option<Decimal>
    where
        F: FnOnce(&[Decimal]) -> Result<Decimal, rp_types::InsufficientDataError>,
    {
        match f(view.window) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(
                    account_id = view.account_id,
                    rule = %rule.name,
                    required = err.required,
                    available = err.available,
                    "rule skipped: insufficient data"
                );
                None
            }
        }
    }

    /// Count a breach under `state_key` and emit unless inside the cooldown.
    fn breach(
        &self,
        rule: &Rule,
        kind: ViolationKind,
        state_key: &str,
        message: String,
        view: &TickView<'_>,
        states: &mut HashMap<String, RuleState>,
    ) {
        let state = states.entry(state_key.to_string()).or_default();
        if !state.record_breach(view.now, rule.cooldown()) {
            debug!(
                account_id = view.account_id,
                rule = state_key,
                suppressed = state.suppressed_count,
                "violation suppressed by cooldown"
            );
            return;
        }

        warn!(
            account_id = view.account_id,
            rule = state_key,
            kind = %kind,
            %message,
            "real-time risk limit breached"
        );
        self.sink.emit(RuleViolation::new(
            &rule.name,
            kind,
            view.account_id,
            message,
            ViolationSeverity::Warning,
            view.now,
        ));
    }

    fn build_snapshot(
        &self,
        policy: &RiskPolicy,
        view: &TickView<'_>,
        max_drawdown: Decimal,
    ) -> RiskSnapshot {
        let (var, cvar, volatility) = if view.sufficient() {
            let var = RiskMetricsCalculator::var(view.window, policy.var_confidence)
                .unwrap_or(Decimal::ZERO);
            let cvar = RiskMetricsCalculator::cvar(view.window, policy.cvar_confidence)
                .unwrap_or(Decimal::ZERO);
            let vol = RiskMetricsCalculator::volatility(view.window).unwrap_or(Decimal::ZERO);
            (var, cvar, vol)
        } else {
            (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
        };

        let risk_budget_used = if policy.risk_budget_pct > Decimal::ZERO {
            var.checked_div(policy.risk_budget_pct).unwrap_or(Decimal::MAX)
        } else {
            Decimal::ZERO
        };

        let stress_results: Vec<StressResult> = RiskMetricsCalculator::stress(
            view.value,
            &policy.stress_scenarios,
            policy.severe_stress_loss_pct,
        );

        RiskSnapshot {
            id: Uuid::new_v4(),
            account_id: view.account_id.to_string(),
            timestamp: view.now,
            portfolio_value: view.value,
            var,
            cvar,
            drawdown: view.drawdown,
            max_drawdown,
            volatility,
            risk_budget_used,
            circuit_breaker_triggered: self.breakers.is_tripped(view.account_id),
            last_return: view.tick_return,
            sample_count: view.window.len(),
            sufficient_data: view.sufficient(),
            stress_results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crossbeam_channel::{unbounded, Receiver};
    use rust_decimal_macros::dec;

    struct Harness {
        monitor: ContinuousRiskMonitor,
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
        let monitor = ContinuousRiskMonitor::new(
            store.clone(),
            breakers.clone(),
            ViolationSink::from_sender(tx, usize::MAX),
        );
        Harness {
            monitor,
            store,
            breakers,
            rx,
        }
    }

    fn equity(account_id: &str, value: Decimal) -> AccountState {
        AccountState::new(account_id, value, value)
    }

    fn kinds(rx: &Receiver<RuleViolation>) -> Vec<ViolationKind> {
        rx.try_iter().map(|v| v.kind).collect()
    }

    /// Quiet policy: only the rule under test is likely to fire.
    fn quiet() -> rp_types::RiskPolicyBuilder {
        RiskPolicy::builder("quiet").without_stress_scenarios()
    }

    /// Equity path with 40 alternating ±1% moves and a few 3–4% drops.
    fn choppy_path() -> Vec<Decimal> {
        let mut value = dec!(100_000);
        let mut path = vec![value];
        for i in 0..40 {
            let r = match i {
                7 | 19 | 31 => dec!(-0.04),
                11 | 23 => dec!(-0.03),
                _ if i % 2 == 0 => dec!(0.01),
                _ => dec!(-0.01),
            };
            value *= Decimal::ONE + r;
            path.push(value);
        }
        path
    }

    #[test]
    fn first_tick_reports_zero_drawdown() {
        let h = harness(RiskPolicy::default());
        let snap = h.monitor.update(&equity("acc-1", dec!(100_000)));
        assert_eq!(snap.drawdown, dec!(0));
        assert_eq!(snap.max_drawdown, dec!(0));
        assert_eq!(snap.last_return, None);
        assert!(!snap.circuit_breaker_triggered);
    }

    #[test]
    fn insufficient_samples_report_zero_metrics() {
        let h = harness(RiskPolicy::default());
        let mut snap = h.monitor.update(&equity("acc-1", dec!(100_000)));
        for i in 1..20 {
            let v = if i % 2 == 0 { dec!(100_000) } else { dec!(95_000) };
            snap = h.monitor.update(&equity("acc-1", v));
        }
        assert_eq!(snap.sample_count, 19);
        assert!(!snap.sufficient_data);
        assert_eq!(snap.var, dec!(0));
        assert_eq!(snap.cvar, dec!(0));
        assert_eq!(snap.volatility, dec!(0));
        // -5% every other tick would breach VaR, but no violation is emitted
        assert!(!kinds(&h.rx).contains(&ViolationKind::VarLimit));
    }

    #[test]
    fn drawdown_tracks_high_water_mark() {
        let h = harness(RiskPolicy::default());
        let t0 = Utc::now();
        let path = [dec!(100), dec!(120), dec!(90), dec!(110), dec!(100)];
        let mut last_max = dec!(0);
        let mut snaps = Vec::new();
        for (i, v) in path.iter().enumerate() {
            let snap = h
                .monitor
                .update_at(&equity("acc-1", *v), t0 + Duration::seconds(i as i64));
            assert!(snap.max_drawdown >= last_max);
            assert!(snap.drawdown <= snap.max_drawdown);
            last_max = snap.max_drawdown;
            snaps.push(snap);
        }
        assert_eq!(snaps[2].drawdown, dec!(0.25));
        assert_eq!(snaps[4].max_drawdown, dec!(0.25));
        assert!(snaps[4].drawdown < dec!(0.25));
    }

    #[test]
    fn drawdown_breach_emits_violation() {
        let h = harness(quiet().with_max_drawdown(dec!(0.10)).build().unwrap());
        h.monitor.update(&equity("acc-1", dec!(100)));
        h.monitor.update(&equity("acc-1", dec!(95)));
        h.monitor.update(&equity("acc-1", dec!(88)));

        let violations: Vec<RuleViolation> = h.rx.try_iter().collect();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::DrawdownLimit);
        assert_eq!(violations[0].rule_name, "drawdown");
        assert_eq!(violations[0].severity, ViolationSeverity::Warning);
    }

    #[test]
    fn circuit_breaker_is_sticky_until_reset() {
        let h = harness(quiet().build().unwrap());
        h.monitor.update(&equity("acc-1", dec!(100_000)));
        let snap = h.monitor.update(&equity("acc-1", dec!(88_000)));
        assert!(snap.circuit_breaker_triggered);
        assert!(h.breakers.is_tripped("acc-1"));

        // Recovery does not clear the breaker, and a second crash does not
        // re-emit.
        h.monitor.update(&equity("acc-1", dec!(100_000)));
        let snap = h.monitor.update(&equity("acc-1", dec!(85_000)));
        assert!(snap.circuit_breaker_triggered);

        let triggered = kinds(&h.rx)
            .into_iter()
            .filter(|k| *k == ViolationKind::CircuitBreakerTriggered)
            .count();
        assert_eq!(triggered, 1);

        h.monitor.reset("acc-1");
        assert!(!h.breakers.is_tripped("acc-1"));
        assert!(!h.monitor.latest("acc-1").unwrap().circuit_breaker_triggered);
        let snap = h.monitor.update(&equity("acc-1", dec!(86_000)));
        assert!(!snap.circuit_breaker_triggered);
    }

    #[test]
    fn breaker_threshold_is_strict() {
        let h = harness(quiet().with_circuit_breaker(dec!(0.10)).build().unwrap());
        h.monitor.update(&equity("acc-1", dec!(100)));
        // exactly -10% does not trip
        let snap = h.monitor.update(&equity("acc-1", dec!(90)));
        assert!(!snap.circuit_breaker_triggered);
    }

    #[test]
    fn trip_on_one_account_does_not_affect_another() {
        let h = harness(quiet().build().unwrap());
        h.monitor.update(&equity("acc-1", dec!(100)));
        h.monitor.update(&equity("acc-2", dec!(100)));
        h.monitor.update(&equity("acc-1", dec!(50)));
        let other = h.monitor.update(&equity("acc-2", dec!(101)));

        assert!(h.breakers.is_tripped("acc-1"));
        assert!(!other.circuit_breaker_triggered);
        assert!(h.monitor.rule_state("acc-2", "circuit_breaker").is_none());
    }

    #[test]
    fn higher_var_confidence_never_lowers_var() {
        let low = harness(quiet().with_var(dec!(0.95), dec!(1)).build().unwrap());
        let high = harness(quiet().with_var(dec!(0.99), dec!(1)).build().unwrap());

        let path = choppy_path();
        let (mut a, mut b) = (None, None);
        for v in &path {
            a = Some(low.monitor.update(&equity("acc-1", *v)));
            b = Some(high.monitor.update(&equity("acc-1", *v)));
        }
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.sufficient_data);
        assert!(b.var >= a.var);
        assert!(a.var > dec!(0));
        assert!(a.cvar >= a.var);
        assert!(a.volatility > dec!(0));
    }

    #[test]
    fn var_breach_respects_cooldown() {
        let policy = quiet()
            .with_var(dec!(0.95), dec!(0.02))
            .with_cvar(dec!(0.95), dec!(1))
            .with_risk_budget(dec!(1))
            .with_violation_cooldown_secs(600)
            .build()
            .unwrap();
        let h = harness(policy);
        let t0 = Utc::now();

        for (i, v) in choppy_path().iter().enumerate() {
            h.monitor
                .update_at(&equity("acc-1", *v), t0 + Duration::seconds(i as i64));
        }
        let first: Vec<ViolationKind> = kinds(&h.rx);
        assert_eq!(
            first.iter().filter(|k| **k == ViolationKind::VarLimit).count(),
            1
        );

        let state = h.monitor.rule_state("acc-1", "var").unwrap();
        assert!(state.violation_count >= 1);
        let suppressed_before = state.suppressed_count;

        // Another breaching tick inside the cooldown is suppressed.
        h.monitor
            .update_at(&equity("acc-1", dec!(80_000)), t0 + Duration::seconds(120));
        assert!(!kinds(&h.rx).contains(&ViolationKind::VarLimit));
        let state = h.monitor.rule_state("acc-1", "var").unwrap();
        assert_eq!(state.suppressed_count, suppressed_before + 1);

        // After the cooldown it fires again.
        h.monitor
            .update_at(&equity("acc-1", dec!(79_000)), t0 + Duration::seconds(700));
        assert!(kinds(&h.rx).contains(&ViolationKind::VarLimit));
    }

    #[test]
    fn cvar_breach_emits_and_counts() {
        let policy = quiet()
            .with_var(dec!(0.95), dec!(1))
            .with_cvar(dec!(0.90), dec!(0.0355))
            .with_risk_budget(dec!(1))
            .with_violation_cooldown_secs(600)
            .build()
            .unwrap();
        let h = harness(policy);
        let t0 = Utc::now();

        let mut snap = None;
        for (i, v) in choppy_path().iter().enumerate() {
            snap = Some(
                h.monitor
                    .update_at(&equity("acc-1", *v), t0 + Duration::seconds(i as i64)),
            );
        }
        let snap = snap.unwrap();
        // Tail at 90%: three -4% and two -3% returns
        assert!((snap.cvar - dec!(0.036)).abs() < dec!(0.000001), "cvar = {}", snap.cvar);

        let violations: Vec<RuleViolation> = h
            .rx
            .try_iter()
            .filter(|v| v.kind == ViolationKind::CvarLimit)
            .collect();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule_name, "cvar");
        assert!(violations[0].message.starts_with("CVaR("));

        // Breaching from the 32nd sample on; all but the first suppressed
        let state = h.monitor.rule_state("acc-1", "cvar").unwrap();
        assert_eq!(state.violation_count, 9);
        assert_eq!(state.suppressed_count, 8);
    }

    #[test]
    fn risk_budget_breach_emits_and_reports_usage() {
        let policy = quiet()
            .with_var(dec!(0.95), dec!(1))
            .with_cvar(dec!(0.95), dec!(1))
            .with_risk_budget(dec!(0.03))
            .with_violation_cooldown_secs(600)
            .build()
            .unwrap();
        let h = harness(policy);
        let t0 = Utc::now();

        let mut snap = None;
        for (i, v) in choppy_path().iter().enumerate() {
            snap = Some(
                h.monitor
                    .update_at(&equity("acc-1", *v), t0 + Duration::seconds(i as i64)),
            );
        }
        let snap = snap.unwrap();
        assert!((snap.var - dec!(0.04)).abs() < dec!(0.000001), "var = {}", snap.var);
        assert_eq!(snap.risk_budget_used, snap.var / dec!(0.03));
        assert!(snap.risk_budget_used > Decimal::ONE);

        let violations: Vec<RuleViolation> = h
            .rx
            .try_iter()
            .filter(|v| v.kind == ViolationKind::RiskBudget)
            .collect();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule_name, "risk_budget");
        assert!(violations[0].message.contains("risk budget"));

        // Every tick with 30..=40 samples breaches
        let state = h.monitor.rule_state("acc-1", "risk_budget").unwrap();
        assert_eq!(state.violation_count, 11);
        assert_eq!(state.suppressed_count, 10);
    }

    #[test]
    fn unrepresentable_tick_return_is_not_recorded() {
        let h = harness(quiet().build().unwrap());
        h.monitor.update(&equity("acc-1", Decimal::new(1, 20)));
        // 1e10 / 1e-20 is out of range
        let snap = h.monitor.update(&equity("acc-1", dec!(10_000_000_000)));
        assert_eq!(snap.last_return, None);
        assert_eq!(snap.sample_count, 0);
        assert!(!snap.circuit_breaker_triggered);

        let snap = h.monitor.update(&equity("acc-1", dec!(9_000_000_000)));
        assert_eq!(snap.last_return, Some(dec!(-0.1)));
        assert_eq!(snap.sample_count, 1);
        assert_eq!(snap.drawdown, dec!(0.1));
    }

    #[test]
    fn concurrent_updates_and_resets_stay_consistent() {
        let h = harness(quiet().build().unwrap());
        let path = choppy_path();

        std::thread::scope(|s| {
            for account_id in ["acc-1", "acc-2"] {
                let (monitor, path) = (&h.monitor, &path);
                s.spawn(move || {
                    let mut last_max = Decimal::ZERO;
                    for round in 0..5 {
                        for (i, v) in path.iter().enumerate() {
                            // A 15% crash every round trips the breaker
                            let value = if i == 20 { *v * dec!(0.85) } else { *v };
                            let snap = monitor.update(&equity(account_id, value));
                            assert!(
                                snap.max_drawdown >= last_max,
                                "round {round} tick {i}: {} < {last_max}",
                                snap.max_drawdown
                            );
                            assert!(snap.drawdown <= snap.max_drawdown);
                            last_max = snap.max_drawdown;
                        }
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..200 {
                    h.monitor.reset("acc-1");
                    if let Some(latest) = h.monitor.latest("acc-1") {
                        assert_eq!(latest.account_id, "acc-1");
                    }
                    std::thread::yield_now();
                }
            });
        });

        h.monitor.reset("acc-1");
        assert!(!h.breakers.is_tripped("acc-1"));
        assert!(!h.monitor.latest("acc-1").unwrap().circuit_breaker_triggered);
        assert!(h.breakers.is_tripped("acc-2"));

        let max_dd = h.monitor.latest("acc-1").unwrap().max_drawdown;
        assert_eq!(max_dd, h.monitor.latest("acc-2").unwrap().max_drawdown);
    }

    #[test]
    fn severe_stress_scenario_emits_without_tripping() {
        let policy = RiskPolicy::builder("stressed")
            .without_stress_scenarios()
            .with_stress_scenario("crash", dec!(-0.30))
            .with_stress_scenario("dip", dec!(-0.05))
            .build()
            .unwrap();
        let h = harness(policy);
        let snap = h.monitor.update(&equity("acc-1", dec!(10_000)));

        assert_eq!(snap.stress_results.len(), 2);
        assert!(!snap.circuit_breaker_triggered);
        let violations: Vec<RuleViolation> = h.rx.try_iter().collect();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::SevereStressTest);
        assert!(violations[0].message.contains("crash"));
        assert!(h.monitor.rule_state("acc-1", "stress_test:crash").is_some());
    }

    #[test]
    fn reset_clears_rule_states_but_keeps_window() {
        let h = harness(quiet().with_max_drawdown(dec!(0.05)).build().unwrap());
        h.monitor.update(&equity("acc-1", dec!(100)));
        h.monitor.update(&equity("acc-1", dec!(90)));
        assert_eq!(h.monitor.rule_state("acc-1", "drawdown").unwrap().violation_count, 1);

        h.monitor.reset("acc-1");
        assert_eq!(
            h.monitor.rule_state("acc-1", "drawdown").unwrap(),
            RuleState::default()
        );
        let snap = h.monitor.update(&equity("acc-1", dec!(91)));
        assert_eq!(snap.sample_count, 2);
        assert_eq!(snap.max_drawdown, dec!(0.1));
    }

    #[test]
    fn seeded_history_enables_window_metrics() {
        let h = harness(quiet().build().unwrap());
        let path = choppy_path();
        h.monitor.seed_history("acc-1", &path[..path.len() - 1]);
        assert!(h.monitor.latest("acc-1").is_none());

        let snap = h.monitor.update(&equity("acc-1", path[path.len() - 1]));
        assert_eq!(snap.sample_count, 40);
        assert!(snap.sufficient_data);
    }

    #[test]
    fn window_is_bounded_by_policy() {
        let h = harness(quiet().with_return_window(30).build().unwrap());
        h.monitor.seed_history("acc-1", &choppy_path());
        let snap = h.monitor.update(&equity("acc-1", dec!(90_000)));
        assert_eq!(snap.sample_count, 30);
    }

    #[test]
    fn batch_updates_every_account() {
        let h = harness(quiet().build().unwrap());
        h.store
            .install("acc-3", quiet().build().unwrap())
            .unwrap();
        let accounts = vec![
            equity("acc-1", dec!(100)),
            equity("acc-2", dec!(200)),
            equity("acc-3", dec!(300)),
        ];
        let snaps = h.monitor.update_batch(&accounts);
        assert_eq!(snaps.len(), 3);
        for (snap, account) in snaps.iter().zip(&accounts) {
            assert_eq!(snap.account_id, account.account_id);
            assert_eq!(snap.portfolio_value, account.portfolio_value);
        }
        assert!(h.monitor.latest("acc-3").is_some());
    }
}
