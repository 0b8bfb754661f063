use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::ExchangePosition;

/// Futures wallet balance for a single asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub total: Decimal,
    pub available: Decimal,
    pub cross_unrealized_pnl: Decimal,
}

impl Balance {
    pub fn empty(asset: &str) -> Self {
        Self {
            asset: asset.to_string(),
            total: Decimal::ZERO,
            available: Decimal::ZERO,
            cross_unrealized_pnl: Decimal::ZERO,
        }
    }

    /// Fraction of the wallet not tied up as margin.
    pub fn available_fraction(&self) -> Decimal {
        if self.total <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.available / self.total
    }
}

/// Balance plus open positions, read together at the start of a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: Balance,
    pub positions: Vec<ExchangePosition>,
    pub fetched_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn position(&self, symbol: &str) -> Option<&ExchangePosition> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    pub fn holds(&self, symbol: &str) -> bool {
        self.position(symbol).is_some()
    }

    /// Number of distinct symbols with an open position.
    ///
    /// A hedged symbol has two legs but occupies one slot.
    pub fn open_symbols(&self) -> usize {
        let mut symbols: Vec<&str> = self.positions.iter().map(|p| p.symbol.as_str()).collect();
        symbols.sort_unstable();
        symbols.dedup();
        symbols.len()
    }
}
