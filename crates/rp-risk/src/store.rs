//! Policy and rule storage.
//!
//! Each account maps to one immutable [`RiskPolicy`] plus the rules compiled
//! from it. Installs validate first and then replace the whole entry in one
//! map insert, so readers see either the old policy or the new one. Global
//! rules apply to every account on top of its own policy.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rp_types::{ConfigValidationError, FieldViolation, RiskPolicy, RuleGroup};
use tracing::{info, warn};

use crate::rules::Rule;

/// Names produced by compiling a policy; global rules may not reuse them.
const POLICY_RULE_NAMES: [&str; 13] = [
    "fund_sufficiency",
    "leverage",
    "concentration",
    "daily_loss",
    "order_size",
    "market_impact",
    "circuit_breaker_halt",
    "circuit_breaker",
    "var",
    "cvar",
    "drawdown",
    "risk_budget",
    "stress_test",
];

#[derive(Debug)]
struct PolicyEntry {
    policy: Arc<RiskPolicy>,
    rules: Vec<Arc<Rule>>,
}

impl PolicyEntry {
    fn compile(policy: RiskPolicy) -> Self {
        let cooldown = policy.violation_cooldown_secs;
        let rules = policy
            .rule_specs()
            .into_iter()
            .map(|spec| Arc::new(Rule::from_spec(spec, cooldown)))
            .collect();
        Self {
            policy: Arc::new(policy),
            rules,
        }
    }
}

/// Thread-safe store of per-account policies and global rules.
#[derive(Debug)]
pub struct RiskPolicyStore {
    policies: DashMap<String, Arc<PolicyEntry>>,
    global_rules: RwLock<Vec<Arc<Rule>>>,
    default_entry: Arc<PolicyEntry>,
}

impl RiskPolicyStore {
    /// Store whose fallback for unconfigured accounts is [`RiskPolicy::default`].
    pub fn new() -> Self {
        Self {
            policies: DashMap::new(),
            global_rules: RwLock::new(Vec::new()),
            default_entry: Arc::new(PolicyEntry::compile(RiskPolicy::default())),
        }
    }

    /// Store with a custom fallback policy.
    pub fn with_default_policy(policy: RiskPolicy) -> Result<Self, ConfigValidationError> {
        policy.validate()?;
        Ok(Self {
            policies: DashMap::new(),
            global_rules: RwLock::new(Vec::new()),
            default_entry: Arc::new(PolicyEntry::compile(policy)),
        })
    }

    /// Validate and install `policy` for `account_id`. On error the previous
    /// policy, if any, stays in force.
    pub fn install(&self, account_id: &str, policy: RiskPolicy) -> Result<(), ConfigValidationError> {
        if let Err(err) = policy.validate() {
            warn!(
                account_id,
                policy = %policy.name,
                violations = err.violations.len(),
                error = %err,
                "policy install rejected"
            );
            return Err(err);
        }

        let name = policy.name.clone();
        let entry = Arc::new(PolicyEntry::compile(policy));
        let rule_count = entry.rules.len();
        self.policies.insert(account_id.to_string(), entry);
        info!(account_id, policy = %name, rules = rule_count, "policy installed");
        Ok(())
    }

    /// Installed policy for `account_id`, if any.
    pub fn get(&self, account_id: &str) -> Option<Arc<RiskPolicy>> {
        self.policies
            .get(account_id)
            .map(|entry| entry.policy.clone())
    }

    /// Installed policy or the store default.
    pub fn effective_policy(&self, account_id: &str) -> Arc<RiskPolicy> {
        self.get(account_id)
            .unwrap_or_else(|| self.default_entry.policy.clone())
    }

    pub fn default_policy(&self) -> Arc<RiskPolicy> {
        self.default_entry.policy.clone()
    }

    pub fn remove(&self, account_id: &str) -> Option<Arc<RiskPolicy>> {
        self.policies
            .remove(account_id)
            .map(|(_, entry)| entry.policy.clone())
    }

    pub fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.policies.iter().map(|e| e.key().clone()).collect();
        accounts.sort();
        accounts
    }

    /// Add a rule evaluated for every account. A rule with the same name
    /// replaces the earlier one.
    pub fn install_global_rule(&self, rule: Rule) -> Result<(), ConfigValidationError> {
        if POLICY_RULE_NAMES.contains(&rule.name.as_str()) {
            return Err(ConfigValidationError::new(
                rule.name.clone(),
                vec![FieldViolation::new(
                    "name",
                    format!("'{}' is reserved for policy rules", rule.name),
                )],
            ));
        }
        rule.validate()?;

        let mut rules = self.global_rules.write();
        rules.retain(|r| r.name != rule.name);
        info!(rule = %rule.name, group = rule.group().as_str(), "global rule installed");
        rules.push(Arc::new(rule));
        Ok(())
    }

    pub fn remove_global_rule(&self, name: &str) -> bool {
        let mut rules = self.global_rules.write();
        let before = rules.len();
        rules.retain(|r| r.name != name);
        rules.len() != before
    }

    pub fn global_rules(&self) -> Vec<Arc<Rule>> {
        self.global_rules.read().clone()
    }

    /// The account's rules of `group` plus global rules of `group`, in
    /// canonical check order. Account rules precede global rules of the same
    /// kind.
    pub fn rules_for(&self, account_id: &str, group: RuleGroup) -> Vec<Arc<Rule>> {
        self.resolve(account_id, group).1
    }

    /// Effective policy and its `group` rules from a single entry lookup, so
    /// the two always belong to the same install.
    pub fn resolve(&self, account_id: &str, group: RuleGroup) -> (Arc<RiskPolicy>, Vec<Arc<Rule>>) {
        let entry = self
            .policies
            .get(account_id)
            .map(|e| e.value().clone())
            .unwrap_or_else(|| self.default_entry.clone());

        let mut rules: Vec<Arc<Rule>> = entry
            .rules
            .iter()
            .filter(|r| r.group() == group)
            .cloned()
            .collect();
        rules.extend(
            self.global_rules
                .read()
                .iter()
                .filter(|r| r.group() == group)
                .cloned(),
        );
        // Stable: keeps account-before-global for equal order keys.
        rules.sort_by_key(|r| r.order());
        (entry.policy.clone(), rules)
    }
}

impl Default for RiskPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}
