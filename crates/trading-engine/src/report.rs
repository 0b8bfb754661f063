//! Periodic account report.

use std::fmt;

use chrono::{DateTime, Utc};
use exchange_core::types::{AccountSnapshot, Side};
use risk_manager::PerformanceSummary;
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PositionLine {
    pub symbol: String,
    pub side: Side,
    pub entry: Decimal,
    pub mark: Decimal,
    pub leverage: u32,
    pub pnl: Decimal,
    /// Leveraged return on margin, percent.
    pub profit_pct: Decimal,
    pub liquidation: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyReport {
    pub total: Decimal,
    pub available: Decimal,
    pub unrealized_pnl: Decimal,
    pub positions: Vec<PositionLine>,
    pub performance: PerformanceSummary,
    pub generated_at: DateTime<Utc>,
}

impl DailyReport {
    pub fn build(account: &AccountSnapshot, performance: PerformanceSummary) -> Self {
        let positions = account
            .positions
            .iter()
            .map(|p| PositionLine {
                symbol: p.symbol.clone(),
                side: p.side,
                entry: p.entry_price,
                mark: p.mark_price,
                leverage: p.leverage,
                pnl: p.unrealized_pnl.round_dp(2),
                profit_pct: p.leveraged_profit_pct().round_dp(2),
                liquidation: p.liquidation_price,
            })
            .collect();

        Self {
            total: account.balance.total,
            available: account.balance.available,
            unrealized_pnl: account.balance.cross_unrealized_pnl,
            positions,
            performance,
            generated_at: Utc::now(),
        }
    }
}

impl fmt::Display for DailyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Balance {} USDT ({} available, unrealized {})",
            self.total.round_dp(2),
            self.available.round_dp(2),
            self.unrealized_pnl.round_dp(2)
        )?;
        if self.positions.is_empty() {
            writeln!(f, "No open positions")?;
        }
        for p in &self.positions {
            writeln!(
                f,
                "  {} {} {}x: entry {} mark {} PnL {} ({}%)",
                p.side, p.symbol, p.leverage, p.entry, p.mark, p.pnl, p.profit_pct
            )?;
        }
        let perf = &self.performance;
        write!(
            f,
            "Trades {} | win rate {:.1}% | ratio {:.2} | realized {}",
            perf.trades,
            perf.win_rate * 100.0,
            perf.ratio,
            perf.total_pnl.round_dp(2)
        )
    }
}
