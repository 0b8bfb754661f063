//! Rate-limited, cached gateway over an [`ExchangeApi`].
//!
//! Every call takes a slot from the caller's request budget (keyed by API key;
//! public market data shares one anonymous budget) and goes through the retry
//! policy. Candle series and symbol metadata are served from TTL/LRU caches
//! so a fresh entry never touches the network.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::rate_limit::RateLimiter;
use super::retry::RetryPolicy;
use super::{Credentials, ExchangeApi};
use crate::cache::{CacheMetrics, TtlCache};
use crate::config::{CacheConfig, ExchangeConfig};
use crate::types::{
    AccountSnapshot, CandleSeries, OrderAck, OrderBookSnapshot, OrderRequest, PositionMode,
    SymbolInfo, Timeframe,
};
use crate::{Error, Result};

const PUBLIC_BUDGET_KEY: &str = "public";

type CandleKey = (String, Timeframe, usize);

pub struct MarketGateway {
    api: Arc<dyn ExchangeApi>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    candles: TtlCache<CandleKey, CandleSeries>,
    symbols: TtlCache<String, SymbolInfo>,
}

impl MarketGateway {
    pub fn new(api: Arc<dyn ExchangeApi>, exchange: &ExchangeConfig, cache: &CacheConfig) -> Self {
        Self {
            api,
            limiter: RateLimiter::new(exchange.requests_per_window, exchange.rate_window()),
            retry: RetryPolicy::new(exchange.retry_attempts, exchange.retry_delay()),
            candles: TtlCache::new(cache.ttl(), cache.capacity),
            symbols: TtlCache::new(cache.ttl(), cache.capacity),
        }
    }

    /// Run one exchange call under `key`'s budget with retries.
    ///
    /// Each attempt spends a budget slot.
    async fn call<T, F, Fut>(&self, key: &str, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry
            .run(operation, || {
                let fut = op();
                async move {
                    self.limiter.acquire(key).await;
                    fut.await
                }
            })
            .await
    }

    pub async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<CandleSeries> {
        let key = (symbol.to_string(), timeframe, limit);
        self.candles
            .get_or_fetch(key, || async {
                let candles = self
                    .call(PUBLIC_BUDGET_KEY, "klines", || self.api.klines(symbol, timeframe, limit))
                    .await?;
                if candles.is_empty() {
                    return Err(Error::validation(format!("{symbol}: no {timeframe} candles")));
                }
                debug!(symbol, timeframe = %timeframe, count = candles.len(), "Fetched candles");
                Ok(CandleSeries::new(symbol, timeframe, candles))
            })
            .await
    }

    pub async fn fetch_symbol_info(&self, creds: &Credentials, symbol: &str) -> Result<SymbolInfo> {
        self.symbols
            .get_or_fetch(symbol.to_string(), || async {
                let filters = self
                    .call(PUBLIC_BUDGET_KEY, "symbol_filters", || self.api.symbol_filters(symbol))
                    .await?;
                let max_leverage = self
                    .call(&creds.api_key, "leverage_bracket", || {
                        self.api.leverage_bracket(creds, symbol)
                    })
                    .await?;
                Ok(filters.with_max_leverage(max_leverage))
            })
            .await
    }

    pub async fn trading_symbols(&self) -> Result<Vec<String>> {
        self.call(PUBLIC_BUDGET_KEY, "trading_symbols", || self.api.trading_symbols())
            .await
    }

    /// Floor, validate and submit an order.
    ///
    /// Quantity is floored to the step size and any stop price to the tick
    /// size. A quantity that floors to nothing tradeable is rejected before
    /// reaching the exchange.
    pub async fn submit_order(&self, creds: &Credentials, request: OrderRequest) -> Result<OrderAck> {
        let info = self.fetch_symbol_info(creds, &request.symbol).await?;

        let mut order = request;
        order.quantity = info.tradeable_quantity(order.quantity)?;
        order.stop_price = order.stop_price.map(|p| info.floor_price(p));
        info.validate_order_values(order.quantity, order.stop_price)?;

        let ack = self
            .call(&creds.api_key, "place_order", || self.api.place_order(creds, &order))
            .await?;
        info!(
            symbol = %order.symbol,
            side = order.side.as_str(),
            order_type = order.order_type.as_str(),
            quantity = %order.quantity,
            order_id = ack.order_id,
            "Order accepted"
        );
        Ok(ack)
    }

    pub async fn get_account(&self, creds: &Credentials) -> Result<AccountSnapshot> {
        let balance = self
            .call(&creds.api_key, "balance", || self.api.balance(creds))
            .await?;
        let positions = self
            .call(&creds.api_key, "positions", || self.api.positions(creds))
            .await?;
        Ok(AccountSnapshot {
            balance,
            positions,
            fetched_at: Utc::now(),
        })
    }

    pub async fn set_leverage(&self, creds: &Credentials, symbol: &str, leverage: u32) -> Result<()> {
        self.call(&creds.api_key, "set_leverage", || {
            self.api.set_leverage(creds, symbol, leverage)
        })
        .await
    }

    pub async fn position_mode(&self, creds: &Credentials) -> Result<PositionMode> {
        self.call(&creds.api_key, "position_mode", || self.api.position_mode(creds))
            .await
    }

    pub async fn set_position_mode(&self, creds: &Credentials, mode: PositionMode) -> Result<()> {
        self.call(&creds.api_key, "set_position_mode", || {
            self.api.set_position_mode(creds, mode)
        })
        .await?;
        info!(?mode, "Position mode set");
        Ok(())
    }

    pub async fn cancel_order(&self, creds: &Credentials, symbol: &str, order_id: i64) -> Result<()> {
        self.call(&creds.api_key, "cancel_order", || {
            self.api.cancel_order(creds, symbol, order_id)
        })
        .await
    }

    pub async fn cancel_all_orders(&self, creds: &Credentials, symbol: &str) -> Result<()> {
        self.call(&creds.api_key, "cancel_all_orders", || {
            self.api.cancel_all_orders(creds, symbol)
        })
        .await
    }

    pub async fn ticker_price(&self, symbol: &str) -> Result<Decimal> {
        self.call(PUBLIC_BUDGET_KEY, "ticker_price", || self.api.ticker_price(symbol))
            .await
    }

    pub async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot> {
        self.call(PUBLIC_BUDGET_KEY, "order_book", || self.api.order_book(symbol, depth))
            .await
    }

    pub fn candle_cache_metrics(&self) -> CacheMetrics {
        self.candles.metrics()
    }

    pub fn symbol_cache_metrics(&self) -> CacheMetrics {
        self.symbols.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::super::MockExchangeApi;
    use super::*;
    use crate::types::{Candle, OrderStatus, Side, SymbolFilters};
    use std::str::FromStr;
    use std::time::Duration;

    fn exchange_config() -> ExchangeConfig {
        ExchangeConfig {
            retry_delay_ms: 10,
            ..Default::default()
        }
    }

    fn candle(close: f64) -> Candle {
        Candle {
            open_time: Utc::now(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    fn filters() -> SymbolFilters {
        SymbolFilters {
            symbol: "ETHUSDT".to_string(),
            tick_size: Decimal::from_str("0.01").unwrap(),
            step_size: Decimal::from_str("0.01").unwrap(),
            min_qty: Decimal::from_str("0.01").unwrap(),
        }
    }

    fn ack(order: &OrderRequest) -> OrderAck {
        OrderAck {
            order_id: 1,
            client_id: order.client_id.to_string(),
            symbol: order.symbol.clone(),
            status: OrderStatus::Filled,
            executed_qty: order.quantity,
            avg_price: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_candles_served_from_cache_until_ttl() {
        let mut api = MockExchangeApi::new();
        api.expect_klines()
            .withf(|symbol, timeframe, limit| {
                symbol == "ETHUSDT" && *timeframe == Timeframe::H1 && *limit == 100
            })
            .times(2)
            .returning(|_, _, _| Ok(vec![candle(100.0), candle(101.0)]));

        let cache = CacheConfig {
            ttl_secs: 60,
            ..Default::default()
        };
        let gateway = MarketGateway::new(Arc::new(api), &exchange_config(), &cache);

        let first = gateway.fetch_candles("ETHUSDT", Timeframe::H1, 100).await.unwrap();
        let second = gateway.fetch_candles("ETHUSDT", Timeframe::H1, 100).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(Arc::ptr_eq(&first.candles, &second.candles));

        tokio::time::advance(Duration::from_secs(61)).await;
        gateway.fetch_candles("ETHUSDT", Timeframe::H1, 100).await.unwrap();

        let metrics = gateway.candle_cache_metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let mut api = MockExchangeApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_ticker_price()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Err(Error::Api {
                    message: "Server error".to_string(),
                    status: Some(503),
                })
            });
        api.expect_ticker_price()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Decimal::from(3000)));

        let gateway = MarketGateway::new(Arc::new(api), &exchange_config(), &CacheConfig::default());
        assert_eq!(gateway.ticker_price("ETHUSDT").await.unwrap(), Decimal::from(3000));
    }

    #[tokio::test]
    async fn test_submit_order_floors_quantity_and_stop() {
        let mut api = MockExchangeApi::new();
        api.expect_symbol_filters().times(1).returning(|_| Ok(filters()));
        api.expect_leverage_bracket().times(1).returning(|_, _| Ok(75));
        api.expect_place_order()
            .withf(|_, order| {
                order.quantity == Decimal::from_str("12.34").unwrap()
                    && order.stop_price == Some(Decimal::from_str("2940.12").unwrap())
            })
            .times(1)
            .returning(|_, order| Ok(ack(order)));

        let gateway = MarketGateway::new(Arc::new(api), &exchange_config(), &CacheConfig::default());
        let creds = Credentials::new("key", "secret");
        let order = OrderRequest::stop_loss(
            "ETHUSDT",
            Side::Long,
            Decimal::from_str("12.345").unwrap(),
            Decimal::from_str("2940.129").unwrap(),
        );
        let ack = gateway.submit_order(&creds, order).await.unwrap();
        assert_eq!(ack.executed_qty, Decimal::from_str("12.34").unwrap());
    }

    #[tokio::test]
    async fn test_dust_quantity_never_reaches_exchange() {
        let mut api = MockExchangeApi::new();
        api.expect_symbol_filters().returning(|_| Ok(filters()));
        api.expect_leverage_bracket().returning(|_, _| Ok(75));
        api.expect_place_order().never();

        let gateway = MarketGateway::new(Arc::new(api), &exchange_config(), &CacheConfig::default());
        let creds = Credentials::new("key", "secret");
        let order = OrderRequest::open("ETHUSDT", Side::Long, Decimal::from_str("0.009").unwrap());
        let err = gateway.submit_order(&creds, order).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_insufficient_margin_is_not_retried() {
        let mut api = MockExchangeApi::new();
        api.expect_symbol_filters().returning(|_| Ok(filters()));
        api.expect_leverage_bracket().returning(|_, _| Ok(75));
        api.expect_place_order().times(1).returning(|_, _| {
            Err(Error::Exchange {
                code: -2019,
                message: "Margin is insufficient.".to_string(),
            })
        });

        let gateway = MarketGateway::new(Arc::new(api), &exchange_config(), &CacheConfig::default());
        let creds = Credentials::new("key", "secret");
        let order = OrderRequest::open("ETHUSDT", Side::Short, Decimal::ONE);
        let err = gateway.submit_order(&creds, order).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InsufficientFunds);
    }

    #[tokio::test]
    async fn test_rejected_mode_switch_is_not_retried() {
        let mut api = MockExchangeApi::new();
        api.expect_position_mode()
            .returning(|_| Ok(PositionMode::OneWay));
        api.expect_set_position_mode()
            .withf(|_, mode| *mode == PositionMode::Hedge)
            .times(1)
            .returning(|_, _| {
                Err(Error::Exchange {
                    code: -4068,
                    message: "Position side cannot be changed if there exists position.".to_string(),
                })
            });

        let gateway = MarketGateway::new(Arc::new(api), &exchange_config(), &CacheConfig::default());
        let creds = Credentials::new("key", "secret");
        assert_eq!(gateway.position_mode(&creds).await.unwrap(), PositionMode::OneWay);
        let err = gateway
            .set_position_mode(&creds, PositionMode::Hedge)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Exchange { code: -4068, .. }));
    }
}
