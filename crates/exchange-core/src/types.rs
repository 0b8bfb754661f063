//! Core domain types for the trading agent.

pub mod account;
pub mod candle;
pub mod market;
pub mod order;
pub mod position;
pub mod settings;

pub use account::*;
pub use candle::*;
pub use market::*;
pub use order::*;
pub use position::*;
pub use settings::*;
