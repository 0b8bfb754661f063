//! Market scan and entry.
//!
//! The engine owns everything shared across users: the gateway, the streamed
//! price book, cached sentiment, the trailing book and the in-flight guard.
//! Lifecycle management lives in [`crate::lifecycle`].

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use exchange_core::api::{MarketGateway, PriceBook};
use exchange_core::config::EngineConfig;
use exchange_core::types::{OrderRequest, PositionMode, Settings, Timeframe};
use exchange_core::{Error, ErrorKind, Result};
use market_signals::{flow, timeframe, IndicatorParams, IndicatorSnapshot, SignalSet};
use risk_manager::sizing::TARGET_ATR_RATIO;
use rust_decimal::Decimal;
use tracing::{debug, info, trace, warn};

use crate::allocator::{self, EntryPlan};
use crate::events::{EventSink, TradingEvent};
use crate::guard::InFlight;
use crate::lifecycle::TrailingBook;
use crate::report::DailyReport;
use crate::scorer::{self, MarketContext, Opportunity};
use crate::sentiment::CachedSentiment;
use crate::session::UserSession;

/// Order book levels read for the pressure signal.
const BOOK_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Session stopped before the scan started.
    Inactive,
    /// Free margin below the user's floor; nothing evaluated.
    InsufficientFunds,
    Completed { evaluated: usize, opened: usize },
}

pub struct Engine {
    pub(crate) gateway: Arc<MarketGateway>,
    pub(crate) prices: Arc<PriceBook>,
    pub(crate) sentiment: CachedSentiment,
    pub(crate) events: EventSink,
    pub(crate) config: EngineConfig,
    pub(crate) params: IndicatorParams,
    pub(crate) trailing: TrailingBook,
    pub(crate) in_flight: InFlight,
    /// Last known account position mode per user.
    position_modes: DashMap<String, PositionMode>,
}

impl Engine {
    pub fn new(
        gateway: Arc<MarketGateway>,
        prices: Arc<PriceBook>,
        sentiment: CachedSentiment,
        events: EventSink,
        config: EngineConfig,
    ) -> Self {
        Self {
            gateway,
            prices,
            sentiment,
            events,
            config,
            params: IndicatorParams::default(),
            trailing: TrailingBook::new(),
            in_flight: InFlight::new(),
            position_modes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn trailing(&self) -> &TrailingBook {
        &self.trailing
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn gateway(&self) -> &Arc<MarketGateway> {
        &self.gateway
    }

    /// Switch the account to hedge mode. Fails while the account holds
    /// positions in one-way mode.
    pub async fn enable_hedge_mode(&self, session: &UserSession) -> Result<()> {
        let creds = session.credentials();
        if self.gateway.position_mode(creds).await? == PositionMode::OneWay {
            self.gateway
                .set_position_mode(creds, PositionMode::Hedge)
                .await?;
        }
        self.position_modes
            .insert(session.id().to_string(), PositionMode::Hedge);
        info!(user_id = session.id(), "Hedge mode enabled");
        Ok(())
    }

    /// Mode new entries are placed in. With hedging on, a one-way account is
    /// switched first; if that fails entries stay one-way and go unhedged.
    pub(crate) async fn entry_position_mode(
        &self,
        session: &UserSession,
        settings: &Settings,
    ) -> Result<PositionMode> {
        let user_id = session.id();
        let known = self.position_modes.get(user_id).map(|m| *m);
        if let Some(mode) = known {
            if mode == PositionMode::Hedge || !settings.hedging_enabled {
                return Ok(mode);
            }
        }
        let mut mode = self.gateway.position_mode(session.credentials()).await?;
        if settings.hedging_enabled && mode == PositionMode::OneWay {
            match self.enable_hedge_mode(session).await {
                Ok(()) => mode = PositionMode::Hedge,
                Err(e) => warn!(user_id, error = %e, "Hedge mode unavailable, entering one-way"),
            }
        }
        self.position_modes.insert(user_id.to_string(), mode);
        Ok(mode)
    }

    pub(crate) fn forget_user(&self, user_id: &str) -> usize {
        self.position_modes.remove(user_id);
        self.trailing.clear_user(user_id)
    }

    async fn universe(&self) -> Result<Vec<String>> {
        if !self.config.universe.is_empty() {
            return Ok(self.config.universe.clone());
        }
        self.gateway.trading_symbols().await
    }

    /// One allocation pass for a user.
    pub async fn run_scan(&self, session: &UserSession) -> Result<ScanOutcome> {
        if !session.is_active() {
            return Ok(ScanOutcome::Inactive);
        }
        let user_id = session.id();
        let settings = session.settings().await;
        let account = self.gateway.get_account(session.credentials()).await?;

        if !allocator::funds_ok(&account.balance, &settings) {
            let retry_at = Utc::now()
                + chrono::Duration::seconds(self.config.funds_cooldown_secs as i64);
            warn!(
                user_id,
                available = %account.balance.available,
                total = %account.balance.total,
                "Insufficient free margin, skipping scan"
            );
            self.events.emit(TradingEvent::InsufficientFunds {
                user_id: user_id.to_string(),
                available: account.balance.available,
                total: account.balance.total,
                retry_at,
            });
            return Ok(ScanOutcome::InsufficientFunds);
        }

        let slots = allocator::free_slots(&account, &settings);
        if slots == 0 {
            debug!(user_id, "No free position slots");
            return Ok(ScanOutcome::Completed {
                evaluated: 0,
                opened: 0,
            });
        }

        let performance_ratio = session.performance_ratio().await;
        let mut evaluated = 0;
        let mut opportunities = Vec::new();
        for symbol in self.universe().await? {
            if !allocator::is_candidate(&symbol, &account, &settings, &self.config) {
                continue;
            }
            evaluated += 1;
            match self
                .evaluate(user_id, &symbol, &settings, performance_ratio)
                .await
            {
                Ok(Some(opportunity)) => opportunities.push(opportunity),
                Ok(None) => {}
                Err(e) => debug!(user_id, symbol = %symbol, error = %e, "Skipping symbol"),
            }
        }

        let mut available = account.balance.available;
        let mut opened = 0;
        for opportunity in scorer::rank(opportunities) {
            if opened == slots {
                break;
            }
            match self
                .open_position(session, &settings, &opportunity, available, performance_ratio)
                .await
            {
                Ok(Some(plan)) => {
                    opened += 1;
                    available -= plan.quantity * plan.price / Decimal::from(plan.leverage);
                }
                Ok(None) => {}
                Err(e) if e.kind() == ErrorKind::InsufficientFunds => {
                    warn!(user_id, symbol = %opportunity.symbol, "Margin exhausted, ending scan");
                    break;
                }
                Err(e) => {
                    warn!(user_id, symbol = %opportunity.symbol, error = %e, "Entry failed");
                    self.events.emit(TradingEvent::Failure {
                        user_id: user_id.to_string(),
                        symbol: Some(opportunity.symbol.clone()),
                        message: e.user_message(),
                    });
                }
            }
        }

        info!(user_id, evaluated, opened, "Scan complete");
        Ok(ScanOutcome::Completed { evaluated, opened })
    }

    /// Signals, gates and score for one symbol. `None` when it is not worth
    /// taking this round.
    async fn evaluate(
        &self,
        user_id: &str,
        symbol: &str,
        settings: &Settings,
        performance_ratio: f64,
    ) -> Result<Option<Opportunity>> {
        let series = self
            .gateway
            .fetch_candles(symbol, settings.timeframe, self.config.candle_limit)
            .await?;
        let signals = SignalSet::compute(&series.candles, &self.params)
            .map_err(|e| Error::validation(format!("{symbol}: {e}")))?;

        if let Some(anomaly) = signals.anomaly {
            info!(user_id, symbol, %anomaly, "Anomalous last bar, excluding symbol");
            self.events.emit(TradingEvent::AnomalyDetected {
                user_id: user_id.to_string(),
                symbol: symbol.to_string(),
                anomaly,
            });
            return Ok(None);
        }

        let Some(rule) = signals.entry_rule() else {
            trace!(symbol, "No entry rule");
            return Ok(None);
        };

        let sentiment = self.sentiment.score(symbol).await;
        if scorer::sentiment_opposes(rule.side(), sentiment, settings.sentiment_threshold) {
            debug!(symbol, sentiment, side = %rule.side(), "Sentiment against entry");
            return Ok(None);
        }

        let book_pressure = match self.gateway.order_book(symbol, BOOK_DEPTH).await {
            Ok(book) => flow::book_pressure(&book),
            Err(e) => {
                debug!(symbol, error = %e, "Order book unavailable");
                0.0
            }
        };

        let context = MarketContext {
            sentiment,
            book_pressure,
            timeframe_bias: self.timeframe_bias(symbol).await,
            performance_ratio,
        };
        let opportunity = Opportunity::new(symbol, rule, &signals, &context);
        if opportunity.score < settings.entry_score_threshold {
            debug!(symbol, score = opportunity.score, "Score below threshold");
            return Ok(None);
        }
        debug!(
            symbol,
            score = opportunity.score,
            side = %opportunity.side,
            "Opportunity"
        );
        Ok(Some(opportunity))
    }

    /// Directional average across the confirmation timeframes. Timeframes
    /// that cannot be read are left out.
    async fn timeframe_bias(&self, symbol: &str) -> f64 {
        let mut biases = Vec::with_capacity(Timeframe::CONFIRMATION.len());
        for tf in Timeframe::CONFIRMATION {
            let series = match self
                .gateway
                .fetch_candles(symbol, tf, self.config.candle_limit)
                .await
            {
                Ok(series) => series,
                Err(e) => {
                    trace!(symbol, timeframe = %tf, error = %e, "Timeframe unavailable");
                    continue;
                }
            };
            if let Ok(snapshot) = IndicatorSnapshot::compute(&series.candles, &self.params) {
                biases.push(timeframe::trend_bias(&snapshot));
            }
        }
        timeframe::average_bias(&biases)
    }

    /// ATR/price from the (usually cached) candles, or the neutral target.
    pub(crate) async fn atr_ratio(&self, symbol: &str, tf: Timeframe) -> f64 {
        match self
            .gateway
            .fetch_candles(symbol, tf, self.config.candle_limit)
            .await
        {
            Ok(series) => IndicatorSnapshot::compute(&series.candles, &self.params)
                .map(|s| s.atr_ratio())
                .unwrap_or(TARGET_ATR_RATIO),
            Err(_) => TARGET_ATR_RATIO,
        }
    }

    async fn open_position(
        &self,
        session: &UserSession,
        settings: &Settings,
        opportunity: &Opportunity,
        available: Decimal,
        performance_ratio: f64,
    ) -> Result<Option<EntryPlan>> {
        let user_id = session.id();
        let symbol = opportunity.symbol.as_str();
        let Some(_guard) = self.in_flight.try_acquire(user_id, symbol) else {
            debug!(user_id, symbol, "Symbol busy, skipping entry");
            return Ok(None);
        };
        session.ensure_active()?;

        let creds = session.credentials();
        let info = self.gateway.fetch_symbol_info(creds, symbol).await?;
        if !allocator::leverage_eligible(&info, &self.config) {
            debug!(symbol, max_leverage = info.max_leverage, "Leverage ceiling too low");
            return Ok(None);
        }

        let plan = allocator::plan_entry(opportunity, &info, settings, available, performance_ratio)?;
        let mode = self.entry_position_mode(session, settings).await?;
        self.gateway.set_leverage(creds, symbol, plan.leverage).await?;

        let order = OrderRequest::open(symbol, plan.side, plan.quantity)
            .with_position_side(mode.position_side(plan.side));
        let ack = self.gateway.submit_order(creds, order).await?;
        let price = ack.avg_price.unwrap_or(plan.price);

        info!(
            user_id,
            symbol,
            side = %plan.side,
            quantity = %plan.quantity,
            leverage = plan.leverage,
            score = opportunity.score,
            "Opened position"
        );
        self.events.emit(TradingEvent::PositionOpened {
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            side: plan.side,
            quantity: plan.quantity,
            leverage: plan.leverage,
            price,
            score: opportunity.score,
        });
        Ok(Some(plan))
    }

    pub async fn run_report(&self, session: &UserSession) -> Result<DailyReport> {
        let account = self.gateway.get_account(session.credentials()).await?;
        let report = DailyReport::build(&account, session.performance_summary().await);
        self.events.emit(TradingEvent::DailyReport {
            user_id: session.id().to_string(),
            report: report.clone(),
        });
        Ok(report)
    }
}
