use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn sign(&self) -> i32 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

/// Order types the gate understands. The gate prices every intent at
/// `OrderIntent::price`, so the type is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

/// A candidate order, read-only input to pre-trade admission control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    /// Unsigned quantity; direction comes from `side`.
    pub size: Decimal,
    pub price: Decimal,
    pub order_type: OrderType,
}

impl OrderIntent {
    pub fn new(
        account_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        size: Decimal,
        price: Decimal,
        order_type: OrderType,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            symbol: symbol.into(),
            side,
            size,
            price,
            order_type,
        }
    }

    pub fn market(
        account_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        size: Decimal,
        price: Decimal,
    ) -> Self {
        Self::new(account_id, symbol, side, size, price, OrderType::Market)
    }

    /// Absolute order value, `|size * price|`.
    pub fn notional(&self) -> Decimal {
        (self.size * self.price).abs()
    }

    /// Quantity with the side applied (negative for sells).
    pub fn signed_size(&self) -> Decimal {
        match self.side {
            Side::Buy => self.size.abs(),
            Side::Sell => -self.size.abs(),
        }
    }
}
