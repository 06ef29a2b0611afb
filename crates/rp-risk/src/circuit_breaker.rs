//! Per-account circuit breakers shared by the monitor and the gate.
//!
//! The monitor trips a breaker, the gate reads it on every order. The
//! tripped flag is an [`AtomicBool`] so the gate's check is a lock-free load;
//! the trip details sit behind a `parking_lot::Mutex` since they are only
//! written when a breaker trips or resets. A tripped breaker stays tripped
//! until [`CircuitBreakerBoard::reset`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info};

/// Why and when a breaker tripped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerTrip {
    pub reason: String,
    pub tripped_at: DateTime<Utc>,
    /// Tick return that caused the trip.
    pub trigger_return: Decimal,
}

#[derive(Debug, Default)]
struct AccountBreaker {
    tripped: AtomicBool,
    trip: Mutex<Option<BreakerTrip>>,
}

/// Registry of circuit breakers keyed by account.
#[derive(Debug, Default)]
pub struct CircuitBreakerBoard {
    breakers: DashMap<String, Arc<AccountBreaker>>,
}

impl CircuitBreakerBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock-free read used on the order path.
    #[inline]
    pub fn is_tripped(&self, account_id: &str) -> bool {
        self.breakers
            .get(account_id)
            .is_some_and(|b| b.tripped.load(Ordering::Acquire))
    }

    /// Trip the account's breaker. Returns `true` if it was not already
    /// tripped; an existing trip keeps its original details.
    pub fn trip(&self, account_id: &str, trip: BreakerTrip) -> bool {
        let breaker = self
            .breakers
            .entry(account_id.to_string())
            .or_default()
            .clone();

        let mut details = breaker.trip.lock();
        if breaker.tripped.load(Ordering::Acquire) {
            return false;
        }
        error!(
            account_id,
            reason = %trip.reason,
            trigger_return = %trip.trigger_return,
            "CIRCUIT BREAKER TRIGGERED: trading halted"
        );
        *details = Some(trip);
        breaker.tripped.store(true, Ordering::Release);
        true
    }

    /// Clear the account's breaker. Returns `true` if it was tripped.
    pub fn reset(&self, account_id: &str) -> bool {
        let Some(breaker) = self.breakers.get(account_id).map(|b| b.clone()) else {
            return false;
        };
        let mut details = breaker.trip.lock();
        let was_tripped = breaker.tripped.swap(false, Ordering::AcqRel);
        *details = None;
        if was_tripped {
            info!(account_id, "circuit breaker reset, trading re-enabled");
        }
        was_tripped
    }

    /// Trip details, if the account's breaker is tripped.
    pub fn status(&self, account_id: &str) -> Option<BreakerTrip> {
        self.breakers
            .get(account_id)
            .and_then(|b| {
                let details = b.trip.lock().clone();
                details
            })
    }

    pub fn tripped_accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self
            .breakers
            .iter()
            .filter(|e| e.value().tripped.load(Ordering::Acquire))
            .map(|e| e.key().clone())
            .collect();
        accounts.sort();
        accounts
    }
}
