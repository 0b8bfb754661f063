//! Order types for futures execution.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position::Side;

/// Side of the order (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Type of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    /// Market order triggered when price crosses the stop against the position.
    StopMarket,
    /// Market order triggered when price crosses the stop in the position's favour.
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// Position side of an order or position.
///
/// `Both` is one-way mode; `Long`/`Short` address a leg in hedge mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Both,
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Both => "BOTH",
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Long => PositionSide::Long,
            Side::Short => PositionSide::Short,
        }
    }
}

/// Account-wide position mode (`dualSidePosition` on the wire).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMode {
    #[default]
    OneWay,
    Hedge,
}

impl PositionMode {
    pub fn from_dual_side(dual: bool) -> Self {
        if dual {
            PositionMode::Hedge
        } else {
            PositionMode::OneWay
        }
    }

    pub fn is_dual_side(&self) -> bool {
        *self == PositionMode::Hedge
    }

    /// Position side an order opening `side` must carry in this mode.
    pub fn position_side(&self, side: Side) -> PositionSide {
        match self {
            PositionMode::OneWay => PositionSide::Both,
            PositionMode::Hedge => PositionSide::for_side(side),
        }
    }
}

/// Current status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// An order ready for submission.
///
/// Quantity and stop price must already be floored to the symbol's step and
/// tick size; the gateway validates before sending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub position_side: PositionSide,
}

impl OrderRequest {
    fn new(symbol: &str, side: OrderSide, order_type: OrderType, quantity: Decimal) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            stop_price: None,
            reduce_only: false,
            position_side: PositionSide::Both,
        }
    }

    /// Market order opening (or adding to) a position on `side`.
    pub fn open(symbol: &str, side: Side, quantity: Decimal) -> Self {
        Self::new(symbol, side.entry_order_side(), OrderType::Market, quantity)
    }

    /// Reduce-only market order closing `quantity` of a `side` position.
    pub fn close(symbol: &str, side: Side, quantity: Decimal) -> Self {
        let mut order = Self::new(symbol, side.exit_order_side(), OrderType::Market, quantity);
        order.reduce_only = true;
        order
    }

    /// Protective stop for a `side` position.
    pub fn stop_loss(symbol: &str, side: Side, quantity: Decimal, stop_price: Decimal) -> Self {
        let mut order = Self::new(symbol, side.exit_order_side(), OrderType::StopMarket, quantity);
        order.stop_price = Some(stop_price);
        order.reduce_only = true;
        order
    }

    /// Take-profit trigger for a `side` position.
    pub fn take_profit(symbol: &str, side: Side, quantity: Decimal, stop_price: Decimal) -> Self {
        let mut order = Self::new(
            symbol,
            side.exit_order_side(),
            OrderType::TakeProfitMarket,
            quantity,
        );
        order.stop_price = Some(stop_price);
        order.reduce_only = true;
        order
    }

    /// Address a hedge-mode leg instead of the one-way position.
    ///
    /// The exchange rejects `reduceOnly` on hedge-mode orders; the leg itself
    /// defines the direction.
    pub fn with_position_side(mut self, position_side: PositionSide) -> Self {
        self.position_side = position_side;
        if position_side != PositionSide::Both {
            self.reduce_only = false;
        }
        self
    }
}

/// Exchange acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: i64,
    pub client_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    pub avg_price: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_reduce_only_on_opposite_side() {
        let order = OrderRequest::close("ETHUSDT", Side::Long, Decimal::ONE);
        assert_eq!(order.side, OrderSide::Sell);
        assert!(order.reduce_only);

        let order = OrderRequest::stop_loss("ETHUSDT", Side::Short, Decimal::ONE, Decimal::TEN);
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.order_type, OrderType::StopMarket);
        assert_eq!(order.stop_price, Some(Decimal::TEN));
    }

    #[test]
    fn test_hedge_leg_drops_reduce_only() {
        let order = OrderRequest::close("ETHUSDT", Side::Short, Decimal::ONE)
            .with_position_side(PositionSide::Short);
        assert!(!order.reduce_only);
        assert_eq!(order.position_side, PositionSide::Short);
    }

    #[test]
    fn test_position_mode_picks_order_side() {
        assert_eq!(PositionMode::OneWay.position_side(Side::Short), PositionSide::Both);
        assert_eq!(PositionMode::Hedge.position_side(Side::Short), PositionSide::Short);
        assert_eq!(PositionMode::from_dual_side(true), PositionMode::Hedge);
        assert!(!PositionMode::OneWay.is_dual_side());
    }
}
