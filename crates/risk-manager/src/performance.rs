//! Per-user closed-trade history and the risk-adjusted ratio derived from it.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use exchange_core::types::Side;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trades kept per user; older records fall off the front.
pub const HISTORY_LIMIT: usize = 200;

/// Below this many trades the ratio is neutral.
pub const MIN_TRADES_FOR_RATIO: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    /// Unleveraged return in the position's favour.
    pub return_fraction: f64,
    pub realized_pnl: Decimal,
    pub closed_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn new(
        symbol: &str,
        side: Side,
        entry_price: Decimal,
        exit_price: Decimal,
        quantity: Decimal,
        closed_at: DateTime<Utc>,
    ) -> Self {
        let sign = side.sign();
        let return_fraction = if entry_price.is_zero() {
            0.0
        } else {
            ((exit_price - entry_price) / entry_price * sign)
                .to_f64()
                .unwrap_or(0.0)
        };
        Self {
            symbol: symbol.to_string(),
            side,
            entry_price,
            exit_price,
            quantity,
            return_fraction,
            realized_pnl: (exit_price - entry_price) * quantity * sign,
            closed_at,
        }
    }

    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub ratio: f64,
    pub total_pnl: Decimal,
}

#[derive(Debug, Clone)]
pub struct PerformanceHistory {
    records: VecDeque<TradeRecord>,
    limit: usize,
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self::new(HISTORY_LIMIT)
    }
}

impl PerformanceHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(limit.min(HISTORY_LIMIT)),
            limit: limit.max(1),
        }
    }

    pub fn record(&mut self, trade: TradeRecord) {
        if self.records.len() == self.limit {
            self.records.pop_front();
        }
        self.records.push_back(trade);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &TradeRecord> {
        self.records.iter()
    }

    /// Mean return over its population standard deviation.
    ///
    /// 1.0 with fewer than [`MIN_TRADES_FOR_RATIO`] trades or zero dispersion.
    pub fn risk_adjusted_ratio(&self) -> f64 {
        let n = self.records.len();
        if n < MIN_TRADES_FOR_RATIO {
            return 1.0;
        }
        let returns: Vec<f64> = self
            .records
            .iter()
            .map(|r| r.return_fraction)
            .filter(|r| r.is_finite())
            .collect();
        if returns.is_empty() {
            return 1.0;
        }
        let count = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / count;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / count;
        let sigma = variance.sqrt();
        if sigma < 1e-12 || !sigma.is_finite() {
            return 1.0;
        }
        mean / sigma
    }

    pub fn summary(&self) -> PerformanceSummary {
        let trades = self.records.len();
        let wins = self.records.iter().filter(|r| r.is_win()).count();
        PerformanceSummary {
            trades,
            wins,
            win_rate: if trades == 0 {
                0.0
            } else {
                wins as f64 / trades as f64
            },
            ratio: self.risk_adjusted_ratio(),
            total_pnl: self.records.iter().map(|r| r.realized_pnl).sum(),
        }
    }
}
