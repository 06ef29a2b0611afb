//! Average true range tracking for volatility-scaled sizing and stops.

use rp_types::Bar;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ATR_PERIOD: usize = 14;

/// Wilder-smoothed ATR over a stream of bars.
///
/// The first value is the simple mean of the first `period` true ranges;
/// after that `atr = (atr * (period - 1) + tr) / period`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrTracker {
    period: usize,
    prev_close: Option<Decimal>,
    warmup_sum: Decimal,
    warmup_count: usize,
    atr: Option<Decimal>,
}

impl AtrTracker {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            warmup_sum: Decimal::ZERO,
            warmup_count: 0,
            atr: None,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Feed one bar. Returns the ATR once the warm-up period has passed.
    pub fn update(&mut self, bar: &Bar) -> Option<Decimal> {
        let tr = bar.true_range(self.prev_close);
        self.prev_close = Some(bar.close);
        let n = Decimal::from(self.period);

        self.atr = match self.atr {
            Some(prev) => Some((prev * (n - Decimal::ONE) + tr) / n),
            None => {
                self.warmup_sum += tr;
                self.warmup_count += 1;
                (self.warmup_count >= self.period).then(|| self.warmup_sum / n)
            }
        };
        self.atr
    }

    pub fn value(&self) -> Option<Decimal> {
        self.atr
    }

    pub fn is_ready(&self) -> bool {
        self.atr.is_some()
    }
}

impl Default for AtrTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ATR_PERIOD)
    }
}
