//! Exchange position types.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::{OrderSide, PositionSide};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Side implied by a signed position amount. Zero means flat.
    pub fn from_amount(amount: Decimal) -> Option<Self> {
        if amount > Decimal::ZERO {
            Some(Side::Long)
        } else if amount < Decimal::ZERO {
            Some(Side::Short)
        } else {
            None
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => f.write_str("LONG"),
            Side::Short => f.write_str("SHORT"),
        }
    }
}

/// An open position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    /// Absolute quantity.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
    pub liquidation_price: Decimal,
}

impl ExchangePosition {
    /// Unleveraged price move in the position's favour, as a fraction.
    pub fn price_move(&self) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (self.mark_price - self.entry_price) / self.entry_price * self.side.sign()
    }

    /// Leveraged return on margin, in percent.
    pub fn leveraged_profit_pct(&self) -> Decimal {
        self.price_move() * Decimal::from(self.leverage) * Decimal::ONE_HUNDRED
    }

    pub fn notional(&self) -> Decimal {
        self.quantity * self.mark_price
    }
}
