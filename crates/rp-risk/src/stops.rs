//! Stop-loss placement and tracking.
//!
//! A [`PositionStop`] holds the stop for one open position. Trailing stops
//! ratchet: they move with favourable prices and never loosen. ATR stops are
//! recomputed from the entry price on every ATR update.
//!
//! [`StopLossEngine`] keeps one stop per `(account, symbol)` and reports a
//! [`StopTrigger`] when a price crosses it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rp_types::{ConfigValidationError, FieldViolation, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How a position's stop is placed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopRule {
    /// Fixed distance from entry.
    Fixed { pct: Decimal },
    /// Fixed distance from the best price seen since entry.
    Trailing { pct: Decimal },
    /// `multiplier` ATRs from entry.
    Atr { multiplier: Decimal },
}

impl StopRule {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let violation = match self {
            StopRule::Fixed { pct } | StopRule::Trailing { pct }
                if *pct <= Decimal::ZERO || *pct >= Decimal::ONE =>
            {
                Some(FieldViolation::new(
                    "pct",
                    format!("must be within (0, 1), got {pct}"),
                ))
            }
            StopRule::Atr { multiplier } if *multiplier <= Decimal::ZERO => Some(
                FieldViolation::new("multiplier", format!("must be > 0, got {multiplier}")),
            ),
            _ => None,
        };
        match violation {
            Some(v) => Err(ConfigValidationError::new("stop_rule", vec![v])),
            None => Ok(()),
        }
    }
}

/// Stop state for one open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionStop {
    pub side: Side,
    pub entry_price: Decimal,
    pub rule: StopRule,
    /// Highest price since entry for longs, lowest for shorts.
    pub best_price: Decimal,
    pub atr: Option<Decimal>,
    stop: Option<Decimal>,
}

impl PositionStop {
    /// `side` is the position direction: `Buy` for long, `Sell` for short.
    pub fn new(side: Side, entry_price: Decimal, rule: StopRule) -> Self {
        let mut stop = Self {
            side,
            entry_price,
            rule,
            best_price: entry_price,
            atr: None,
            stop: None,
        };
        stop.stop = stop.compute();
        stop
    }

    fn is_long(&self) -> bool {
        self.side == Side::Buy
    }

    /// `base` moved `distance` against the position.
    fn offset(&self, base: Decimal, distance: Decimal) -> Decimal {
        if self.is_long() {
            base - distance
        } else {
            base + distance
        }
    }

    fn compute(&self) -> Option<Decimal> {
        match self.rule {
            StopRule::Fixed { pct } => Some(self.offset(self.entry_price, self.entry_price * pct)),
            StopRule::Trailing { pct } => Some(self.offset(self.best_price, self.best_price * pct)),
            StopRule::Atr { multiplier } => self
                .atr
                .map(|atr| self.offset(self.entry_price, atr * multiplier)),
        }
    }

    /// Feed a new price. Returns the stop in force afterwards.
    pub fn update(&mut self, price: Decimal) -> Option<Decimal> {
        if let StopRule::Trailing { .. } = self.rule {
            let improved = if self.is_long() {
                price > self.best_price
            } else {
                price < self.best_price
            };
            if improved {
                self.best_price = price;
                let candidate = self.compute();
                // Ratchet: only ever tighten.
                self.stop = match (self.stop, candidate) {
                    (Some(current), Some(next)) if self.is_long() => Some(current.max(next)),
                    (Some(current), Some(next)) => Some(current.min(next)),
                    (current, next) => next.or(current),
                };
            }
        }
        self.stop
    }

    /// Record the latest ATR. ATR stops are recomputed from entry.
    pub fn update_atr(&mut self, atr: Decimal) -> Option<Decimal> {
        self.atr = Some(atr);
        if let StopRule::Atr { .. } = self.rule {
            self.stop = self.compute();
        }
        self.stop
    }

    /// Current stop price; `None` for an ATR stop that has not seen an ATR.
    pub fn stop_price(&self) -> Option<Decimal> {
        self.stop
    }

    pub fn should_stop(&self, price: Decimal) -> bool {
        match self.stop {
            Some(stop) if self.is_long() => price <= stop,
            Some(stop) => price >= stop,
            None => false,
        }
    }
}

/// A stop that has been hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopTrigger {
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub stop_price: Decimal,
    pub trigger_price: Decimal,
    pub rule: StopRule,
    pub triggered_at: DateTime<Utc>,
}

/// Stops for every open position, keyed by `(account, symbol)`.
#[derive(Debug, Default)]
pub struct StopLossEngine {
    stops: DashMap<(String, String), PositionStop>,
}

impl StopLossEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(account_id: &str, symbol: &str) -> (String, String) {
        (account_id.to_string(), symbol.to_string())
    }

    /// Start tracking a stop, replacing any existing one for the position.
    /// Returns the initial stop price.
    pub fn open(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        entry_price: Decimal,
        rule: StopRule,
    ) -> Result<Option<Decimal>, ConfigValidationError> {
        rule.validate()?;
        let stop = PositionStop::new(side, entry_price, rule);
        let price = stop.stop_price();
        debug!(account_id, symbol, ?side, %entry_price, ?rule, stop = ?price, "stop opened");
        self.stops.insert(Self::key(account_id, symbol), stop);
        Ok(price)
    }

    /// Feed a price. When the stop is hit the position's stop is removed and
    /// the trigger returned.
    pub fn on_price(&self, account_id: &str, symbol: &str, price: Decimal) -> Option<StopTrigger> {
        self.on_price_at(account_id, symbol, price, Utc::now())
    }

    pub fn on_price_at(
        &self,
        account_id: &str,
        symbol: &str,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<StopTrigger> {
        let key = Self::key(account_id, symbol);
        let trigger = {
            let mut stop = self.stops.get_mut(&key)?;
            stop.update(price);
            if !stop.should_stop(price) {
                return None;
            }
            StopTrigger {
                account_id: account_id.to_string(),
                symbol: symbol.to_string(),
                side: stop.side,
                stop_price: stop.stop_price()?,
                trigger_price: price,
                rule: stop.rule,
                triggered_at: now,
            }
        };
        self.stops.remove(&key);
        warn!(
            account_id,
            symbol,
            stop_price = %trigger.stop_price,
            price = %price,
            "stop-loss triggered"
        );
        Some(trigger)
    }

    pub fn update_atr(&self, account_id: &str, symbol: &str, atr: Decimal) -> Option<Decimal> {
        self.stops
            .get_mut(&Self::key(account_id, symbol))?
            .update_atr(atr)
    }

    pub fn stop_price(&self, account_id: &str, symbol: &str) -> Option<Decimal> {
        self.stops
            .get(&Self::key(account_id, symbol))?
            .stop_price()
    }

    pub fn get(&self, account_id: &str, symbol: &str) -> Option<PositionStop> {
        self.stops
            .get(&Self::key(account_id, symbol))
            .map(|s| s.clone())
    }

    /// Stop tracking the position, e.g. after it was closed.
    pub fn close(&self, account_id: &str, symbol: &str) -> Option<PositionStop> {
        self.stops
            .remove(&Self::key(account_id, symbol))
            .map(|(_, stop)| stop)
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }
}
