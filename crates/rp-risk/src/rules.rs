//! Named rule instances and their per-account mutable state.

use chrono::{DateTime, Duration, Utc};
use rp_types::{ConfigValidationError, FieldViolation, RuleGroup, RuleSpec};
use serde::{Deserialize, Serialize};

/// Default suppression window between repeated violations of one rule.
pub const DEFAULT_COOLDOWN_SECS: u64 = 300;

/// A named, typed rule. Immutable once installed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub spec: RuleSpec,
    pub cooldown_secs: u64,
}

impl Rule {
    pub fn new(name: impl Into<String>, spec: RuleSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
        }
    }

    /// Rule named after its kind, as produced when compiling a policy.
    pub fn from_spec(spec: RuleSpec, cooldown_secs: u64) -> Self {
        Self {
            name: spec.kind_name().to_string(),
            spec,
            cooldown_secs,
        }
    }

    pub fn with_cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub fn group(&self) -> RuleGroup {
        self.spec.group()
    }

    pub fn order(&self) -> u8 {
        self.spec.order()
    }

    pub fn cooldown(&self) -> Duration {
        // chrono caps durations at i64::MAX milliseconds
        Duration::seconds(self.cooldown_secs.min((i64::MAX / 1_000) as u64) as i64)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut violations = Vec::new();
        self.spec
            .validate_into(&format!("{}.", self.name), &mut violations);
        if self.name.trim().is_empty() {
            violations.push(FieldViolation::new("name", "must not be empty"));
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigValidationError::new(self.name.clone(), violations))
        }
    }
}

/// Mutable counters for one rule on one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleState {
    pub violation_count: u64,
    pub suppressed_count: u64,
    pub last_violation_time: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl RuleState {
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Count a breach. Returns `true` when the violation should be emitted,
    /// `false` when it falls inside the cooldown window.
    pub fn record_breach(&mut self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        self.violation_count += 1;
        if self.in_cooldown(now) {
            self.suppressed_count += 1;
            return false;
        }
        self.last_violation_time = Some(now);
        self.cooldown_until = Some(
            now.checked_add_signed(cooldown)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        true
    }

    pub fn reset(&mut self) {
        *self = RuleState::default();
    }
}
