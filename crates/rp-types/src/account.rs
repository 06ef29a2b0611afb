use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Open position held by an account. `size` is signed: negative = short.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub size: Decimal,
    pub entry_price: Decimal,
}

impl PositionState {
    pub fn new(size: Decimal, entry_price: Decimal) -> Self {
        Self { size, entry_price }
    }

    pub fn is_long(&self) -> bool {
        self.size > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.size < Decimal::ZERO
    }
}

/// Point-in-time account view supplied by the caller on every check and
/// monitor tick. The engine reads it and never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub account_id: String,
    pub cash: Decimal,
    pub portfolio_value: Decimal,
    pub positions: HashMap<String, PositionState>,
    /// Realized loss for the current trading day as a positive amount.
    pub daily_realized_loss: Decimal,
}

impl AccountState {
    pub fn new(account_id: impl Into<String>, cash: Decimal, portfolio_value: Decimal) -> Self {
        Self {
            account_id: account_id.into(),
            cash,
            portfolio_value,
            positions: HashMap::new(),
            daily_realized_loss: Decimal::ZERO,
        }
    }

    /// Account holding only cash.
    pub fn cash_only(account_id: impl Into<String>, cash: Decimal) -> Self {
        Self::new(account_id, cash, cash)
    }

    pub fn with_position(mut self, symbol: impl Into<String>, size: Decimal, entry_price: Decimal) -> Self {
        self.positions
            .insert(symbol.into(), PositionState::new(size, entry_price));
        self
    }

    pub fn with_daily_realized_loss(mut self, loss: Decimal) -> Self {
        self.daily_realized_loss = loss;
        self
    }

    /// Signed position size for `symbol`, zero when flat.
    pub fn position_size(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_lookup() {
        let account = AccountState::cash_only("acc", dec!(10_000))
            .with_position("ETHUSDT", dec!(-3), dec!(2_000));
        assert_eq!(account.position_size("ETHUSDT"), dec!(-3));
        assert_eq!(account.position_size("BTCUSDT"), dec!(0));
        assert!(account.positions["ETHUSDT"].is_short());
    }
}
