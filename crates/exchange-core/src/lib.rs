//! Exchange Core Library
//!
//! Shared types, the cached rate-limited market-data gateway, and exchange
//! adapters for the leveraged-futures trading agent.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod precision;
pub mod types;

pub use error::{Error, ErrorKind, Result};
