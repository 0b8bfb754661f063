//! Live market data mirrored into the paper exchange.

use std::collections::HashSet;
use std::sync::Arc;

use exchange_core::api::{ExchangeApi, PaperExchange, PriceBook};
use exchange_core::types::{PriceTick, SymbolInfo, Timeframe};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Leverage brackets need a signed call; paper symbols get the usual cap.
const PAPER_MAX_LEVERAGE: u32 = 125;
const BOOK_DEPTH: usize = 20;

pub struct PaperMarket {
    live: Arc<dyn ExchangeApi>,
    paper: Arc<PaperExchange>,
    symbols: Vec<String>,
    candle_limit: usize,
}

impl PaperMarket {
    pub fn new(
        live: Arc<dyn ExchangeApi>,
        paper: Arc<PaperExchange>,
        symbols: Vec<String>,
        candle_limit: usize,
    ) -> Self {
        Self {
            live,
            paper,
            symbols,
            candle_limit,
        }
    }

    /// Register every symbol with its filters and last price.
    ///
    /// Symbols the live exchange cannot describe are left out.
    pub async fn seed(&self) -> usize {
        let mut seeded = 0;
        for symbol in &self.symbols {
            let filters = match self.live.symbol_filters(symbol).await {
                Ok(filters) => filters,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Skipping paper symbol");
                    continue;
                }
            };
            let price = match self.live.ticker_price(symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "No price for paper symbol");
                    continue;
                }
            };
            self.paper.add_symbol(
                SymbolInfo {
                    symbol: filters.symbol,
                    tick_size: filters.tick_size,
                    step_size: filters.step_size,
                    min_qty: filters.min_qty,
                    max_leverage: PAPER_MAX_LEVERAGE,
                },
                price,
            );
            seeded += 1;
        }
        self.refresh().await;
        info!(seeded, requested = self.symbols.len(), "Paper market seeded");
        seeded
    }

    /// Copy candles and order books from the live exchange.
    pub async fn refresh(&self) {
        for symbol in &self.symbols {
            for timeframe in Timeframe::CONFIRMATION {
                match self.live.klines(symbol, timeframe, self.candle_limit).await {
                    Ok(candles) => self.paper.set_candles(symbol, timeframe, candles),
                    Err(e) => debug!(symbol = %symbol, %timeframe, error = %e, "Paper candle refresh failed"),
                }
            }
            match self.live.order_book(symbol, BOOK_DEPTH).await {
                Ok(book) => self.paper.set_order_book(book),
                Err(e) => debug!(symbol = %symbol, error = %e, "Paper book refresh failed"),
            }
        }
    }
}

/// Forward streamed prices to both the price book and the paper exchange, so
/// resting paper stops trigger on live moves.
pub fn spawn_price_mirror(
    prices: Arc<PriceBook>,
    paper: Arc<PaperExchange>,
    symbols: &[String],
    mut rx: mpsc::Receiver<Vec<PriceTick>>,
) -> JoinHandle<()> {
    let symbols: HashSet<String> = symbols.iter().cloned().collect();
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            for tick in batch {
                prices.update(&tick.symbol, tick.price);
                if symbols.contains(&tick.symbol) {
                    paper.set_price(&tick.symbol, tick.price);
                }
            }
        }
        warn!("Ticker stream closed");
    })
}
