//! Process wiring: exchange, price feed, engine and sessions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use exchange_core::api::{
    subscribe_tickers, BinanceFuturesClient, ExchangeApi, MarketGateway, PaperExchange, PriceBook,
};
use exchange_core::config::AppConfig;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use trading_engine::{
    event_channel, CachedSentiment, Engine, NeutralSentiment, SessionManager, TradingEvent,
};

use crate::paper::{spawn_price_mirror, PaperMarket};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

pub struct Agent {
    config: AppConfig,
    gateway: Arc<MarketGateway>,
    sessions: SessionManager,
    events: mpsc::Receiver<TradingEvent>,
    background: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Trade on Binance USDT-M futures.
    pub fn live(config: AppConfig) -> Result<Self> {
        let api: Arc<dyn ExchangeApi> = Arc::new(
            BinanceFuturesClient::new(&config.exchange).context("building exchange client")?,
        );
        let prices = Arc::new(PriceBook::new(config.engine.price_staleness()));
        let feed = prices
            .clone()
            .spawn_feed(subscribe_tickers(&config.exchange.ws_url));
        Ok(Self::assemble(config, api, prices, vec![feed]))
    }

    /// Trade against an in-memory exchange mirroring live market data.
    pub async fn paper(config: AppConfig, balance: u64) -> Result<Self> {
        if config.engine.universe.is_empty() {
            anyhow::bail!("paper trading needs an explicit engine.universe");
        }
        let live: Arc<dyn ExchangeApi> = Arc::new(
            BinanceFuturesClient::new(&config.exchange).context("building exchange client")?,
        );
        let paper = Arc::new(PaperExchange::new(Decimal::from(balance)));
        let market = Arc::new(PaperMarket::new(
            live,
            paper.clone(),
            config.engine.universe.clone(),
            config.engine.candle_limit,
        ));
        if market.seed().await == 0 {
            anyhow::bail!("no paper symbols could be seeded");
        }

        let prices = Arc::new(PriceBook::new(config.engine.price_staleness()));
        let mirror = spawn_price_mirror(
            prices.clone(),
            paper.clone(),
            &config.engine.universe,
            subscribe_tickers(&config.exchange.ws_url),
        );

        let period = config.engine.scan_interval();
        let refresh = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                market.refresh().await;
            }
        });

        info!(balance, "Paper trading enabled");
        Ok(Self::assemble(config, paper, prices, vec![mirror, refresh]))
    }

    fn assemble(
        config: AppConfig,
        api: Arc<dyn ExchangeApi>,
        prices: Arc<PriceBook>,
        background: Vec<JoinHandle<()>>,
    ) -> Self {
        let gateway = Arc::new(MarketGateway::new(api, &config.exchange, &config.cache));
        let sentiment = CachedSentiment::new(
            Arc::new(NeutralSentiment),
            config.cache.sentiment_ttl(),
            config.cache.capacity,
        );
        let (sink, events) = event_channel(config.engine.event_buffer);
        let engine = Arc::new(Engine::new(
            gateway.clone(),
            prices,
            sentiment,
            sink,
            config.engine.clone(),
        ));
        Self {
            config,
            gateway,
            sessions: SessionManager::new(engine),
            events,
            background,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let mut started = 0;
        for user in &self.config.users {
            match self.sessions.register(user) {
                Ok(_) => started += 1,
                Err(e) => error!(user_id = %user.id, error = %e, "Failed to start user"),
            }
        }
        if started == 0 {
            anyhow::bail!("no user session could be started");
        }
        info!(users = started, "Trading loops running");

        let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
        stats_tick.tick().await;

        loop {
            tokio::select! {
                maybe_event = self.events.recv() => {
                    match maybe_event {
                        Some(event) => log_event(&event),
                        None => {
                            warn!("Event channel closed");
                            break;
                        }
                    }
                }
                _ = stats_tick.tick() => {
                    let candles = self.gateway.candle_cache_metrics();
                    let symbols = self.gateway.symbol_cache_metrics();
                    info!(
                        candle_hit_rate = candles.hit_rate(),
                        candle_evictions = candles.evictions,
                        symbol_hit_rate = symbols.hit_rate(),
                        sessions = self.sessions.user_ids().len(),
                        "Runtime stats"
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.sessions.stop_all();
        for handle in self.background.drain(..) {
            handle.abort();
        }
        info!("Trading agent stopped; open positions remain on the exchange");
        Ok(())
    }
}

fn log_event(event: &TradingEvent) {
    let user_id = event.user_id();
    let kind = event.kind();
    match event {
        TradingEvent::Failure { .. } | TradingEvent::InsufficientFunds { .. } => {
            warn!(user_id, kind, "{event}")
        }
        _ => info!(user_id, kind, "{event}"),
    }
}
