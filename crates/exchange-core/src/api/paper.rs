//! In-memory paper exchange.
//!
//! Fills market orders at the configured price, keeps one-way and hedge-mode
//! positions (one-way until switched, like a fresh account), and holds stop/take-profit orders until [`PaperExchange::set_price`]
//! crosses them. Used for dry runs and as the exchange in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::{Credentials, ExchangeApi};
use crate::types::{
    Balance, Candle, ExchangePosition, OrderAck, OrderBookSnapshot, OrderRequest, OrderSide,
    OrderStatus, OrderType, PositionMode, PositionSide, PriceLevel, Side, SymbolFilters, SymbolInfo,
    Timeframe,
};
use crate::{Error, Result};

const DEFAULT_LEVERAGE: u32 = 20;

#[derive(Debug, Clone)]
struct PaperPosition {
    side: Side,
    quantity: Decimal,
    entry_price: Decimal,
    leverage: u32,
    margin: Decimal,
}

#[derive(Debug, Default)]
struct PaperState {
    mode: PositionMode,
    prices: HashMap<String, Decimal>,
    symbols: HashMap<String, SymbolInfo>,
    candles: HashMap<(String, Timeframe), Vec<Candle>>,
    books: HashMap<String, OrderBookSnapshot>,
    wallet: Decimal,
    available: Decimal,
    positions: HashMap<(String, PositionSide), PaperPosition>,
    leverage: HashMap<String, u32>,
    open_orders: HashMap<i64, OrderRequest>,
    next_order_id: i64,
    filled: Vec<OrderRequest>,
    injected_failures: VecDeque<(i64, String)>,
}

fn order_direction(side: OrderSide) -> Side {
    match side {
        OrderSide::Buy => Side::Long,
        OrderSide::Sell => Side::Short,
    }
}

impl PaperState {
    fn price(&self, symbol: &str) -> Result<Decimal> {
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::validation(format!("no paper price for {symbol}")))
    }

    fn fill(&mut self, order: &OrderRequest) -> Result<Decimal> {
        let price = self.price(&order.symbol)?;
        let key = (order.symbol.clone(), order.position_side);
        let direction = order_direction(order.side);

        let reduces = matches!(self.positions.get(&key), Some(p) if p.side != direction);
        if reduces {
            self.reduce(&key, order.quantity, price);
        } else {
            if order.reduce_only || order.position_side != PositionSide::Both {
                let opens_leg = order.position_side == PositionSide::for_side(direction);
                if order.reduce_only || !opens_leg {
                    return Err(Error::Exchange {
                        code: -2022,
                        message: "ReduceOnly Order is rejected.".to_string(),
                    });
                }
            }
            self.open(key, direction, order.quantity, price)?;
        }
        self.filled.push(order.clone());
        Ok(price)
    }

    fn open(
        &mut self,
        key: (String, PositionSide),
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<()> {
        let leverage = self.leverage.get(&key.0).copied().unwrap_or(DEFAULT_LEVERAGE);
        let margin = quantity * price / Decimal::from(leverage);
        if margin > self.available {
            return Err(Error::Exchange {
                code: -2019,
                message: "Margin is insufficient.".to_string(),
            });
        }
        self.available -= margin;

        let position = self.positions.entry(key).or_insert(PaperPosition {
            side,
            quantity: Decimal::ZERO,
            entry_price: price,
            leverage,
            margin: Decimal::ZERO,
        });
        let total = position.quantity + quantity;
        position.entry_price = (position.entry_price * position.quantity + price * quantity) / total;
        position.quantity = total;
        position.margin += margin;
        Ok(())
    }

    fn reduce(&mut self, key: &(String, PositionSide), quantity: Decimal, price: Decimal) {
        let Some(position) = self.positions.get_mut(key) else {
            return;
        };
        let closed = quantity.min(position.quantity);
        let pnl = (price - position.entry_price) * closed * position.side.sign();
        let released = position.margin * closed / position.quantity;

        position.quantity -= closed;
        position.margin -= released;
        self.available += released + pnl;
        self.wallet += pnl;

        if position.quantity.is_zero() {
            self.positions.remove(key);
        }
    }

    fn next_id(&mut self) -> i64 {
        self.next_order_id += 1;
        self.next_order_id
    }

    /// Trigger resting stop and take-profit orders crossed by `price`.
    fn trigger(&mut self, symbol: &str, price: Decimal) {
        let crossed: Vec<i64> = self
            .open_orders
            .iter()
            .filter(|(_, o)| o.symbol == symbol)
            .filter(|(_, o)| {
                let Some(stop) = o.stop_price else {
                    return false;
                };
                match (o.order_type, o.side) {
                    (OrderType::StopMarket, OrderSide::Sell) => price <= stop,
                    (OrderType::StopMarket, OrderSide::Buy) => price >= stop,
                    (OrderType::TakeProfitMarket, OrderSide::Sell) => price >= stop,
                    (OrderType::TakeProfitMarket, OrderSide::Buy) => price <= stop,
                    (OrderType::Market, _) => false,
                }
            })
            .map(|(id, _)| *id)
            .collect();

        for id in crossed {
            if let Some(order) = self.open_orders.remove(&id) {
                // Triggered reduce-only orders on a flat book simply expire.
                if let Err(e) = self.fill(&order) {
                    debug!(order_id = id, error = %e, "Paper trigger expired");
                } else {
                    info!(order_id = id, symbol, price = %price, "Paper trigger filled");
                }
            }
        }
    }
}

pub struct PaperExchange {
    state: Mutex<PaperState>,
    kline_calls: AtomicUsize,
}

impl PaperExchange {
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState {
                wallet: balance,
                available: balance,
                ..Default::default()
            }),
            kline_calls: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_symbol(&self, info: SymbolInfo, price: Decimal) {
        let mut state = self.lock();
        state.prices.insert(info.symbol.clone(), price);
        state.symbols.insert(info.symbol.clone(), info);
    }

    /// Move the price and fire any crossed triggers.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.lock();
        state.prices.insert(symbol.to_string(), price);
        state.trigger(symbol, price);
    }

    pub fn set_candles(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.lock()
            .candles
            .insert((symbol.to_string(), timeframe), candles);
    }

    pub fn set_order_book(&self, book: OrderBookSnapshot) {
        self.lock().books.insert(book.symbol.clone(), book);
    }

    /// Reject the next order with the given exchange error code.
    pub fn fail_next_order(&self, code: i64, message: &str) {
        self.lock()
            .injected_failures
            .push_back((code, message.to_string()));
    }

    /// Market orders filled so far, in order.
    pub fn filled_orders(&self) -> Vec<OrderRequest> {
        self.lock().filled.clone()
    }

    /// Resting stop and take-profit orders.
    pub fn open_orders(&self) -> Vec<(i64, OrderRequest)> {
        let mut orders: Vec<_> = self
            .lock()
            .open_orders
            .iter()
            .map(|(id, o)| (*id, o.clone()))
            .collect();
        orders.sort_by_key(|(id, _)| *id);
        orders
    }

    pub fn kline_calls(&self) -> usize {
        self.kline_calls.load(Ordering::SeqCst)
    }

    /// Available balance without going through the trait.
    pub fn available(&self) -> Decimal {
        self.lock().available
    }
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    async fn klines(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        self.kline_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        let candles = state
            .candles
            .get(&(symbol.to_string(), timeframe))
            .ok_or_else(|| Error::validation(format!("no paper candles for {symbol} {timeframe}")))?;
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn trading_symbols(&self) -> Result<Vec<String>> {
        let mut symbols: Vec<String> = self.lock().symbols.keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let state = self.lock();
        let info = state
            .symbols
            .get(symbol)
            .ok_or_else(|| Error::validation(format!("unknown symbol {symbol}")))?;
        Ok(SymbolFilters {
            symbol: info.symbol.clone(),
            tick_size: info.tick_size,
            step_size: info.step_size,
            min_qty: info.min_qty,
        })
    }

    async fn leverage_bracket(&self, _creds: &Credentials, symbol: &str) -> Result<u32> {
        self.lock()
            .symbols
            .get(symbol)
            .map(|s| s.max_leverage)
            .ok_or_else(|| Error::validation(format!("unknown symbol {symbol}")))
    }

    async fn balance(&self, _creds: &Credentials) -> Result<Balance> {
        let state = self.lock();
        let unrealized: Decimal = state
            .positions
            .iter()
            .filter_map(|((symbol, _), p)| {
                let price = state.prices.get(symbol)?;
                Some((*price - p.entry_price) * p.quantity * p.side.sign())
            })
            .sum();
        Ok(Balance {
            asset: "USDT".to_string(),
            total: state.wallet,
            available: state.available,
            cross_unrealized_pnl: unrealized,
        })
    }

    async fn positions(&self, _creds: &Credentials) -> Result<Vec<ExchangePosition>> {
        let state = self.lock();
        let mut positions: Vec<ExchangePosition> = state
            .positions
            .iter()
            .map(|((symbol, position_side), p)| {
                let mark = state.prices.get(symbol).copied().unwrap_or(p.entry_price);
                ExchangePosition {
                    symbol: symbol.clone(),
                    side: p.side,
                    position_side: *position_side,
                    quantity: p.quantity,
                    entry_price: p.entry_price,
                    mark_price: mark,
                    leverage: p.leverage,
                    unrealized_pnl: (mark - p.entry_price) * p.quantity * p.side.sign(),
                    liquidation_price: Decimal::ZERO,
                }
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn set_leverage(&self, _creds: &Credentials, symbol: &str, leverage: u32) -> Result<()> {
        let mut state = self.lock();
        let max = state.symbols.get(symbol).map(|s| s.max_leverage).unwrap_or(leverage);
        if leverage == 0 || leverage > max {
            return Err(Error::Exchange {
                code: -4028,
                message: format!("Leverage {leverage} is not valid"),
            });
        }
        state.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn position_mode(&self, _creds: &Credentials) -> Result<PositionMode> {
        Ok(self.lock().mode)
    }

    async fn set_position_mode(&self, _creds: &Credentials, mode: PositionMode) -> Result<()> {
        let mut state = self.lock();
        if state.mode == mode {
            return Ok(());
        }
        if !state.positions.is_empty() {
            return Err(Error::Exchange {
                code: -4068,
                message: "Position side cannot be changed if there exists position.".to_string(),
            });
        }
        if !state.open_orders.is_empty() {
            return Err(Error::Exchange {
                code: -4067,
                message: "Position side cannot be changed if there exists open orders.".to_string(),
            });
        }
        state.mode = mode;
        info!(?mode, "Paper position mode changed");
        Ok(())
    }

    async fn place_order(&self, _creds: &Credentials, order: &OrderRequest) -> Result<OrderAck> {
        let mut state = self.lock();
        if let Some((code, message)) = state.injected_failures.pop_front() {
            return Err(Error::Exchange { code, message });
        }
        let hedge_leg = order.position_side != PositionSide::Both;
        if hedge_leg != state.mode.is_dual_side() {
            return Err(Error::Exchange {
                code: -4061,
                message: "Order's position side does not match user's setting.".to_string(),
            });
        }

        let order_id = state.next_id();
        let (status, executed_qty, avg_price) = match order.order_type {
            OrderType::Market => {
                let price = state.fill(order)?;
                (OrderStatus::Filled, order.quantity, Some(price))
            }
            OrderType::StopMarket | OrderType::TakeProfitMarket => {
                state.open_orders.insert(order_id, order.clone());
                (OrderStatus::New, Decimal::ZERO, None)
            }
        };

        Ok(OrderAck {
            order_id,
            client_id: order.client_id.to_string(),
            symbol: order.symbol.clone(),
            status,
            executed_qty,
            avg_price,
        })
    }

    async fn cancel_order(&self, _creds: &Credentials, symbol: &str, order_id: i64) -> Result<()> {
        let mut state = self.lock();
        match state.open_orders.get(&order_id) {
            Some(o) if o.symbol == symbol => {
                state.open_orders.remove(&order_id);
                Ok(())
            }
            _ => Err(Error::Exchange {
                code: -2011,
                message: "Unknown order sent.".to_string(),
            }),
        }
    }

    async fn cancel_all_orders(&self, _creds: &Credentials, symbol: &str) -> Result<()> {
        self.lock().open_orders.retain(|_, o| o.symbol != symbol);
        Ok(())
    }

    async fn ticker_price(&self, symbol: &str) -> Result<Decimal> {
        self.lock().price(symbol)
    }

    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot> {
        let state = self.lock();
        if let Some(book) = state.books.get(symbol) {
            let mut book = book.clone();
            book.bids.truncate(depth);
            book.asks.truncate(depth);
            return Ok(book);
        }
        let price = state.price(symbol)?;
        Ok(OrderBookSnapshot {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            bids: vec![PriceLevel {
                price,
                quantity: Decimal::ONE,
            }],
            asks: vec![PriceLevel {
                price,
                quantity: Decimal::ONE,
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> PaperExchange {
        let paper = PaperExchange::new(Decimal::from(1000));
        paper.add_symbol(
            SymbolInfo {
                symbol: "BTCUSDT".to_string(),
                tick_size: Decimal::new(1, 1),
                step_size: Decimal::new(1, 3),
                min_qty: Decimal::new(1, 3),
                max_leverage: 125,
            },
            Decimal::from(100),
        );
        paper
    }

    fn creds() -> Credentials {
        Credentials::new("paper", "paper")
    }

    #[tokio::test]
    async fn test_open_and_close_realizes_pnl() {
        let paper = exchange();
        paper.set_leverage(&creds(), "BTCUSDT", 10).await.unwrap();
        paper
            .place_order(&creds(), &OrderRequest::open("BTCUSDT", Side::Long, Decimal::from(5)))
            .await
            .unwrap();
        assert_eq!(paper.available(), Decimal::from(950));

        paper.set_price("BTCUSDT", Decimal::from(110));
        paper
            .place_order(&creds(), &OrderRequest::close("BTCUSDT", Side::Long, Decimal::from(5)))
            .await
            .unwrap();

        let balance = paper.balance(&creds()).await.unwrap();
        assert_eq!(balance.total, Decimal::from(1050));
        assert_eq!(balance.available, Decimal::from(1050));
        assert!(paper.positions(&creds()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_triggers_on_cross() {
        let paper = exchange();
        paper
            .place_order(&creds(), &OrderRequest::open("BTCUSDT", Side::Long, Decimal::ONE))
            .await
            .unwrap();
        paper
            .place_order(
                &creds(),
                &OrderRequest::stop_loss("BTCUSDT", Side::Long, Decimal::ONE, Decimal::from(98)),
            )
            .await
            .unwrap();
        assert_eq!(paper.open_orders().len(), 1);

        paper.set_price("BTCUSDT", Decimal::from(99));
        assert_eq!(paper.positions(&creds()).await.unwrap().len(), 1);

        paper.set_price("BTCUSDT", Decimal::from(97));
        assert!(paper.positions(&creds()).await.unwrap().is_empty());
        assert!(paper.open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_margin() {
        let paper = exchange();
        let err = paper
            .place_order(&creds(), &OrderRequest::open("BTCUSDT", Side::Short, Decimal::from(1000)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Exchange { code: -2019, .. }));
    }

    #[tokio::test]
    async fn test_hedge_legs_are_independent() {
        let paper = exchange();
        paper.set_position_mode(&creds(), PositionMode::Hedge).await.unwrap();
        let long = OrderRequest::open("BTCUSDT", Side::Long, Decimal::ONE)
            .with_position_side(PositionSide::Long);
        let short = OrderRequest::open("BTCUSDT", Side::Short, Decimal::ONE)
            .with_position_side(PositionSide::Short);
        paper.place_order(&creds(), &long).await.unwrap();
        paper.place_order(&creds(), &short).await.unwrap();
        assert_eq!(paper.positions(&creds()).await.unwrap().len(), 2);

        let close_short = OrderRequest::close("BTCUSDT", Side::Short, Decimal::ONE)
            .with_position_side(PositionSide::Short);
        paper.place_order(&creds(), &close_short).await.unwrap();
        let positions = paper.positions(&creds()).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Long);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let paper = exchange();
        paper.fail_next_order(-1111, "Precision is over the maximum defined for this asset.");
        let order = OrderRequest::open("BTCUSDT", Side::Long, Decimal::ONE);
        assert!(paper.place_order(&creds(), &order).await.is_err());
        assert!(paper.place_order(&creds(), &order).await.is_ok());
    }

    #[tokio::test]
    async fn test_position_side_must_match_mode() {
        let paper = exchange();
        assert_eq!(paper.position_mode(&creds()).await.unwrap(), PositionMode::OneWay);
        let leg = OrderRequest::open("BTCUSDT", Side::Long, Decimal::ONE)
            .with_position_side(PositionSide::Long);
        let err = paper.place_order(&creds(), &leg).await.unwrap_err();
        assert!(matches!(err, Error::Exchange { code: -4061, .. }));

        paper.set_position_mode(&creds(), PositionMode::Hedge).await.unwrap();
        paper.place_order(&creds(), &leg).await.unwrap();
        let one_way = OrderRequest::open("BTCUSDT", Side::Long, Decimal::ONE);
        assert!(paper.place_order(&creds(), &one_way).await.is_err());
    }

    #[tokio::test]
    async fn test_mode_is_fixed_while_positions_are_open() {
        let paper = exchange();
        paper
            .place_order(&creds(), &OrderRequest::open("BTCUSDT", Side::Long, Decimal::ONE))
            .await
            .unwrap();
        let err = paper
            .set_position_mode(&creds(), PositionMode::Hedge)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Exchange { code: -4068, .. }));
        // Asking for the current mode is a no-op.
        paper.set_position_mode(&creds(), PositionMode::OneWay).await.unwrap();
    }
}
