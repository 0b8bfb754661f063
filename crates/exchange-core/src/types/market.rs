//! Symbol metadata, order book and ticker types.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::precision::{floor_to_step, is_multiple_of};
use crate::{Error, Result};

/// Price and quantity filters from the public exchange metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub symbol: String,
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
}

impl SymbolFilters {
    /// Combine with the account's leverage bracket.
    pub fn with_max_leverage(self, max_leverage: u32) -> SymbolInfo {
        SymbolInfo {
            symbol: self.symbol,
            tick_size: self.tick_size,
            step_size: self.step_size,
            min_qty: self.min_qty,
            max_leverage,
        }
    }
}

/// Exchange trading rules for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    /// Price granularity (PRICE_FILTER.tickSize).
    pub tick_size: Decimal,
    /// Quantity granularity (LOT_SIZE.stepSize).
    pub step_size: Decimal,
    /// Smallest accepted quantity (LOT_SIZE.minQty).
    pub min_qty: Decimal,
    /// Highest leverage of the first notional bracket.
    pub max_leverage: u32,
}

impl SymbolInfo {
    pub fn floor_price(&self, price: Decimal) -> Decimal {
        floor_to_step(price, self.tick_size)
    }

    pub fn floor_quantity(&self, quantity: Decimal) -> Decimal {
        floor_to_step(quantity, self.step_size)
    }

    /// Floor a quantity and reject it if nothing tradeable is left.
    pub fn tradeable_quantity(&self, quantity: Decimal) -> Result<Decimal> {
        let floored = self.floor_quantity(quantity);
        if floored <= Decimal::ZERO || floored < self.min_qty {
            return Err(Error::validation(format!(
                "{}: quantity {} below minimum {} (step {})",
                self.symbol, quantity, self.min_qty, self.step_size
            )));
        }
        Ok(floored)
    }

    /// Check that values already respect the symbol's granularity.
    ///
    /// Anything that reaches the exchange off-grid is a bug upstream, so this
    /// is a hard validation failure rather than a silent re-round.
    pub fn validate_order_values(&self, quantity: Decimal, price: Option<Decimal>) -> Result<()> {
        if !is_multiple_of(quantity, self.step_size) {
            return Err(Error::validation(format!(
                "{}: quantity {} is not a multiple of step {}",
                self.symbol, quantity, self.step_size
            )));
        }
        if let Some(price) = price {
            if price <= Decimal::ZERO || !is_multiple_of(price, self.tick_size) {
                return Err(Error::validation(format!(
                    "{}: price {} is not a positive multiple of tick {}",
                    self.symbol, price, self.tick_size
                )));
            }
        }
        Ok(())
    }
}

/// A single price level in the order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Top-of-book depth snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl OrderBookSnapshot {
    /// Returns the best bid price (highest buy order).
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Returns the best ask price (lowest sell order).
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    pub fn bid_volume(&self) -> f64 {
        self.bids.iter().filter_map(|l| l.quantity.to_f64()).sum()
    }

    pub fn ask_volume(&self) -> f64 {
        self.asks.iter().filter_map(|l| l.quantity.to_f64()).sum()
    }
}

/// Last traded price from the live ticker stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn btc() -> SymbolInfo {
        SymbolInfo {
            symbol: "BTCUSDT".to_string(),
            tick_size: Decimal::from_str("0.10").unwrap(),
            step_size: Decimal::from_str("0.001").unwrap(),
            min_qty: Decimal::from_str("0.001").unwrap(),
            max_leverage: 125,
        }
    }

    #[test]
    fn test_tradeable_quantity_floors() {
        let info = btc();
        let qty = info.tradeable_quantity(Decimal::from_str("0.01789").unwrap()).unwrap();
        assert_eq!(qty, Decimal::from_str("0.017").unwrap());
    }

    #[test]
    fn test_tradeable_quantity_rejects_dust() {
        let info = btc();
        let err = info
            .tradeable_quantity(Decimal::from_str("0.0009").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_validate_order_values() {
        let info = btc();
        assert!(info
            .validate_order_values(
                Decimal::from_str("0.017").unwrap(),
                Some(Decimal::from_str("64000.1").unwrap())
            )
            .is_ok());
        assert!(info
            .validate_order_values(Decimal::from_str("0.0175").unwrap(), None)
            .is_err());
        assert!(info
            .validate_order_values(
                Decimal::from_str("0.017").unwrap(),
                Some(Decimal::from_str("64000.15").unwrap())
            )
            .is_err());
    }
}
