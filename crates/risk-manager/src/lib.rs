//! Risk Manager
//!
//! Trailing stop/take-profit state per position, trade performance history and
//! the sizing rules that turn a score into leverage and quantity.

pub mod performance;
pub mod sizing;
pub mod trailing;

pub use performance::{PerformanceHistory, PerformanceSummary, TradeRecord};
pub use sizing::{leverage_for_score, performance_scale, volatility_factor, SizingInput};
pub use trailing::{ExitReason, HedgeRef, PartialLevel, TrailingParams, TrailingState};
