//! Exchange access: the raw API seam, its adapters, and the gateway that
//! wraps every call in rate budgeting, retry and caching.

pub mod binance;
pub mod gateway;
pub mod paper;
pub mod rate_limit;
pub mod retry;
pub mod stream;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{
    Balance, Candle, ExchangePosition, OrderAck, OrderBookSnapshot, OrderRequest, PositionMode,
    SymbolFilters, Timeframe,
};
use crate::Result;

pub use binance::BinanceFuturesClient;
pub use gateway::MarketGateway;
pub use paper::PaperExchange;
pub use rate_limit::RateLimiter;
pub use retry::{CallOutcome, RetryPolicy};
pub use stream::{subscribe_tickers, PriceBook};

/// API key pair for authenticated exchange calls.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Raw exchange operations.
///
/// Implementations only translate between typed records and the wire; rate
/// budgeting, retries and caching are the gateway's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn klines(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>>;

    /// Perpetual USDT-margined symbols currently open for trading.
    async fn trading_symbols(&self) -> Result<Vec<String>>;

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters>;

    /// Maximum leverage of the account's first notional bracket.
    async fn leverage_bracket(&self, creds: &Credentials, symbol: &str) -> Result<u32>;

    /// USDT wallet balance.
    async fn balance(&self, creds: &Credentials) -> Result<Balance>;

    /// Open (non-zero) positions.
    async fn positions(&self, creds: &Credentials) -> Result<Vec<ExchangePosition>>;

    async fn set_leverage(&self, creds: &Credentials, symbol: &str, leverage: u32) -> Result<()>;

    async fn position_mode(&self, creds: &Credentials) -> Result<PositionMode>;

    /// Fails while the account holds positions or open orders.
    async fn set_position_mode(&self, creds: &Credentials, mode: PositionMode) -> Result<()>;

    async fn place_order(&self, creds: &Credentials, order: &OrderRequest) -> Result<OrderAck>;

    async fn cancel_order(&self, creds: &Credentials, symbol: &str, order_id: i64) -> Result<()>;

    async fn cancel_all_orders(&self, creds: &Credentials, symbol: &str) -> Result<()>;

    async fn ticker_price(&self, symbol: &str) -> Result<Decimal>;

    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot>;
}
