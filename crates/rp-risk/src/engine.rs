//! The assembled risk engine.
//!
//! [`RiskEngine`] wires one policy store, one circuit breaker board, the
//! pre-trade gate, the continuous monitor, the stop-loss engine and the
//! violation sink together. It is constructed explicitly and shared by
//! reference; there is no global instance.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rp_types::{
    AccountState, ConfigValidationError, OrderIntent, RiskPolicy, RiskResult,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::circuit_breaker::{BreakerTrip, CircuitBreakerBoard};
use crate::gate::{GateDecision, GateStats, PreTradeGate};
use crate::metrics::RiskSnapshot;
use crate::monitor::ContinuousRiskMonitor;
use crate::rules::{Rule, RuleState};
use crate::sink::{DispatchPolicy, DispatchStats, NotificationDispatcher, Notifier, SinkStats, ViolationSink};
use crate::sizing::SizingRequest;
use crate::stops::StopLossEngine;
use crate::store::RiskPolicyStore;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Bound of the violation queue; events beyond it are dropped.
    pub sink_capacity: usize,
    pub dispatch: DispatchPolicy,
    /// Policy applied to accounts without one of their own.
    pub default_policy: RiskPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sink_capacity: 1024,
            dispatch: DispatchPolicy::default(),
            default_policy: RiskPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parse from JSON and validate the default policy.
    pub fn from_json(json: &str) -> RiskResult<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.default_policy.validate()?;
        Ok(config)
    }
}

/// Pre-trade gate, continuous monitor, sizing inputs and stops behind one
/// handle.
pub struct RiskEngine {
    store: Arc<RiskPolicyStore>,
    breakers: Arc<CircuitBreakerBoard>,
    gate: PreTradeGate,
    monitor: ContinuousRiskMonitor,
    stops: StopLossEngine,
    sink: ViolationSink,
    dispatcher: Mutex<Option<NotificationDispatcher>>,
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("store", &self.store)
            .field("breakers", &self.breakers)
            .field("gate", &self.gate)
            .field("monitor", &self.monitor)
            .field("stops", &self.stops)
            .field("sink", &self.sink)
            .field("dispatcher_running", &self.dispatcher.lock().is_some())
            .finish()
    }
}

impl RiskEngine {
    /// Build an engine whose violations are delivered to `notifier` on a
    /// background dispatcher thread.
    pub fn new(config: EngineConfig, notifier: Arc<dyn Notifier>) -> RiskResult<Self> {
        let (sink, rx) = ViolationSink::bounded(config.sink_capacity);
        let dispatch = config.dispatch;
        let mut engine = Self::with_sink(config, sink)?;
        let dispatcher = NotificationDispatcher::spawn(rx, notifier, dispatch)?;
        engine.dispatcher = Mutex::new(Some(dispatcher));
        Ok(engine)
    }

    /// Build an engine that emits into a caller-owned sink. No dispatcher is
    /// started; the caller drains the queue.
    pub fn with_sink(config: EngineConfig, sink: ViolationSink) -> RiskResult<Self> {
        let policy_name = config.default_policy.name.clone();
        let store = Arc::new(RiskPolicyStore::with_default_policy(config.default_policy)?);
        let breakers = Arc::new(CircuitBreakerBoard::new());

        let gate = PreTradeGate::new(store.clone(), breakers.clone(), sink.clone());
        let monitor = ContinuousRiskMonitor::new(store.clone(), breakers.clone(), sink.clone());

        info!(
            default_policy = %policy_name,
            sink_capacity = config.sink_capacity,
            "risk engine initialised"
        );

        Ok(Self {
            store,
            breakers,
            gate,
            monitor,
            stops: StopLossEngine::new(),
            sink,
            dispatcher: Mutex::new(None),
        })
    }

    // ---- configuration ----

    pub fn install_policy(&self, account_id: &str, policy: RiskPolicy) -> Result<(), ConfigValidationError> {
        self.store.install(account_id, policy)
    }

    pub fn install_global_rule(&self, rule: Rule) -> Result<(), ConfigValidationError> {
        self.store.install_global_rule(rule)
    }

    pub fn remove_global_rule(&self, name: &str) -> bool {
        self.store.remove_global_rule(name)
    }

    /// Installed policy for the account; `None` when it runs on the default.
    pub fn policy(&self, account_id: &str) -> Option<Arc<RiskPolicy>> {
        self.store.get(account_id)
    }

    pub fn effective_policy(&self, account_id: &str) -> Arc<RiskPolicy> {
        self.store.effective_policy(account_id)
    }

    pub fn store(&self) -> &RiskPolicyStore {
        &self.store
    }

    // ---- pre-trade ----

    pub fn check(&self, intent: &OrderIntent, account: &AccountState) -> GateDecision {
        self.gate.check(intent, account)
    }

    pub fn check_at(
        &self,
        intent: &OrderIntent,
        account: &AccountState,
        now: DateTime<Utc>,
    ) -> GateDecision {
        self.gate.check_at(intent, account, now)
    }

    /// Add a realized loss to the account's daily ledger.
    pub fn record_realized_loss(&self, account_id: &str, loss: Decimal) {
        self.gate.record_realized_loss(account_id, loss);
    }

    pub fn gate_stats(&self) -> GateStats {
        self.gate.stats()
    }

    // ---- real-time ----

    pub fn update(&self, account: &AccountState) -> RiskSnapshot {
        self.monitor.update(account)
    }

    pub fn update_at(&self, account: &AccountState, now: DateTime<Utc>) -> RiskSnapshot {
        self.monitor.update_at(account, now)
    }

    pub fn update_batch(&self, accounts: &[AccountState]) -> Vec<RiskSnapshot> {
        self.monitor.update_batch(accounts)
    }

    pub fn seed_history(&self, account_id: &str, values: &[Decimal]) {
        self.monitor.seed_history(account_id, values);
    }

    /// Clear the account's circuit breaker and rule counters.
    pub fn reset(&self, account_id: &str) {
        self.monitor.reset(account_id);
    }

    pub fn latest_snapshot(&self, account_id: &str) -> Option<Arc<RiskSnapshot>> {
        self.monitor.latest(account_id)
    }

    pub fn rule_state(&self, account_id: &str, rule: &str) -> Option<RuleState> {
        self.monitor.rule_state(account_id, rule)
    }

    pub fn is_circuit_breaker_tripped(&self, account_id: &str) -> bool {
        self.breakers.is_tripped(account_id)
    }

    pub fn circuit_breaker_status(&self, account_id: &str) -> Option<BreakerTrip> {
        self.breakers.status(account_id)
    }

    // ---- sizing & stops ----

    /// Sizing inputs carrying the account's latest risk snapshot.
    pub fn sizing_request(&self, account_id: &str, account_value: Decimal, price: Decimal) -> SizingRequest {
        let req = SizingRequest::new(account_value, price);
        match self.latest_snapshot(account_id) {
            Some(snapshot) => req.with_risk(snapshot),
            None => req,
        }
    }

    pub fn stops(&self) -> &StopLossEngine {
        &self.stops
    }

    // ---- sink ----

    pub fn sink(&self) -> &ViolationSink {
        &self.sink
    }

    pub fn sink_stats(&self) -> SinkStats {
        self.sink.stats()
    }

    /// Stop the dispatcher after draining queued violations. Returns `None`
    /// when the engine was built without one or it is already stopped.
    pub fn shutdown(&self) -> Option<DispatchStats> {
        let dispatcher = self.dispatcher.lock().take()?;
        let stats = dispatcher.shutdown();
        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            "risk engine dispatcher stopped"
        );
        Some(stats)
    }
}
