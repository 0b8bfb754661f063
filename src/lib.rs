//! Leverage Agent: autonomous leveraged-futures trading
//!
//! This is the root crate that provides benchmark access to the internal modules.
//! For actual functionality, use the individual crates directly:
//!
//! - `exchange-core`: Domain types, configuration, exchange gateway and caches
//! - `market-signals`: Indicators, levels, flow, prediction and anomaly checks
//! - `risk-manager`: Trailing stops, position sizing, performance history
//! - `trading-engine`: Scoring, allocation, position lifecycle and sessions
//! - `agent`: The trading binary

// Re-export for benchmarks
pub use exchange_core as core;
pub use market_signals as signals;
pub use risk_manager as risk;
pub use trading_engine as trading;
