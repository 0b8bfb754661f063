//! Position lifecycle.
//!
//! Each (user, symbol) moves through `NONE → OPEN_UNMANAGED → MANAGED →
//! CLOSED`. A position the exchange reports without local state is seeded:
//! protective orders first, then the state is committed. Every monitor tick
//! then runs, in order, stagnation, exit, partial take-profit, hedging and the
//! trailing update. Each step commits only after its orders are accepted, so an
//! order failure part-way leaves the state as it was after the last successful
//! step. Protective orders are replaced new-first: the old pair is cancelled by
//! id only once its successor rests on the exchange.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use exchange_core::types::{AccountSnapshot, ExchangePosition, OrderRequest, PositionSide, Settings};
use exchange_core::{Error, Result};
use risk_manager::{
    ExitReason, HedgeRef, SizingInput, TradeRecord, TrailingParams, TrailingState,
};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::events::TradingEvent;
use crate::session::UserSession;

/// Trailing state per user and symbol.
///
/// Accessors hand out clones; no map reference outlives a call.
#[derive(Default)]
pub struct TrailingBook {
    users: DashMap<String, DashMap<String, TrailingState>>,
}

impl TrailingBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str, symbol: &str) -> Option<TrailingState> {
        self.users
            .get(user_id)
            .and_then(|states| states.get(symbol).map(|s| s.clone()))
    }

    pub fn put(&self, user_id: &str, state: TrailingState) {
        self.users
            .entry(user_id.to_string())
            .or_default()
            .insert(state.symbol.clone(), state);
    }

    pub fn remove(&self, user_id: &str, symbol: &str) -> Option<TrailingState> {
        self.users
            .get(user_id)
            .and_then(|states| states.remove(symbol).map(|(_, s)| s))
    }

    pub fn symbols(&self, user_id: &str) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .users
            .get(user_id)
            .map(|states| states.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default();
        symbols.sort();
        symbols
    }

    pub fn count(&self, user_id: &str) -> usize {
        self.users.get(user_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn clear_user(&self, user_id: &str) -> usize {
        self.users
            .remove(user_id)
            .map(|(_, states)| states.len())
            .unwrap_or(0)
    }
}

/// The exchange legs of one symbol.
struct Legs<'a> {
    primary: &'a ExchangePosition,
    hedge: Option<&'a ExchangePosition>,
}

/// The leg matching local state, or the largest leg when there is none.
fn legs_for<'a>(
    account: &'a AccountSnapshot,
    symbol: &str,
    state: Option<&TrailingState>,
) -> Option<Legs<'a>> {
    let legs: Vec<&ExchangePosition> = account
        .positions
        .iter()
        .filter(|p| p.symbol == symbol)
        .collect();
    let primary = state
        .and_then(|s| {
            legs.iter()
                .copied()
                .find(|p| p.side == s.side && p.position_side == s.position_side)
        })
        .or_else(|| legs.iter().copied().max_by_key(|p| p.quantity))?;
    let hedge = legs.iter().copied().find(|p| p.side != primary.side);
    Some(Legs { primary, hedge })
}

fn matches_exchange(state: &TrailingState, position: &ExchangePosition) -> bool {
    state.side == position.side && state.position_side == position.position_side
}

impl Engine {
    /// One monitor tick for a user: reconcile, then manage every position.
    ///
    /// Returns how many symbols were managed without error.
    pub async fn run_monitor(&self, session: &UserSession) -> Result<usize> {
        if !session.is_active() {
            return Ok(0);
        }
        let user_id = session.id();
        let settings = session.settings().await;
        let account = self.gateway.get_account(session.credentials()).await?;

        for symbol in self.trailing.symbols(user_id) {
            if account.holds(&symbol) {
                continue;
            }
            let Some(_guard) = self.in_flight.try_acquire(user_id, &symbol) else {
                continue;
            };
            if let Some(state) = self.trailing.remove(user_id, &symbol) {
                info!(user_id, symbol = %symbol, "Position closed outside the agent");
                self.events.emit(TradingEvent::PositionClosed {
                    user_id: user_id.to_string(),
                    symbol,
                    side: state.side,
                    reason: ExitReason::External,
                    exit_price: None,
                    pnl: None,
                });
            }
        }

        let mut symbols: Vec<&str> = account.positions.iter().map(|p| p.symbol.as_str()).collect();
        symbols.sort_unstable();
        symbols.dedup();

        let mut managed = 0;
        for symbol in symbols {
            let Some(_guard) = self.in_flight.try_acquire(user_id, symbol) else {
                debug!(user_id, symbol, "Symbol busy, skipping tick");
                continue;
            };
            match self.manage_symbol(session, &settings, &account, symbol).await {
                Ok(()) => managed += 1,
                Err(Error::TradingStopped(_)) => return Ok(managed),
                Err(e) => {
                    warn!(user_id, symbol, error = %e, "Lifecycle step failed");
                    self.events.emit(TradingEvent::Failure {
                        user_id: user_id.to_string(),
                        symbol: Some(symbol.to_string()),
                        message: e.user_message(),
                    });
                }
            }
        }
        Ok(managed)
    }

    async fn manage_symbol(
        &self,
        session: &UserSession,
        settings: &Settings,
        account: &AccountSnapshot,
        symbol: &str,
    ) -> Result<()> {
        let user_id = session.id();
        let existing = self.trailing.get(user_id, symbol);
        let Some(legs) = legs_for(account, symbol, existing.as_ref()) else {
            return Ok(());
        };

        let state = match existing {
            Some(state) if matches_exchange(&state, legs.primary) => state,
            Some(state) => {
                warn!(
                    user_id,
                    symbol,
                    local = %state.side,
                    exchange = %legs.primary.side,
                    "Local state disagrees with exchange, re-seeding"
                );
                self.trailing.remove(user_id, symbol);
                self.seed(session, settings, &legs).await?
            }
            None => self.seed(session, settings, &legs).await?,
        };

        let price = self
            .prices
            .fresh_price(symbol)
            .unwrap_or(legs.primary.mark_price);
        self.tick(session, settings, state, &legs, price).await
    }

    /// Place the protective orders for a newly observed position and commit
    /// its state.
    async fn seed(
        &self,
        session: &UserSession,
        settings: &Settings,
        legs: &Legs<'_>,
    ) -> Result<TrailingState> {
        session.ensure_active()?;
        let position = legs.primary;
        let mut state = TrailingState::seed(
            &position.symbol,
            position.side,
            position.position_side,
            position.entry_price,
            position.quantity,
            TrailingParams::from(settings),
            Utc::now(),
        );
        let opened_at = state.opened_at;
        state.hedge = legs.hedge.map(|h| HedgeRef {
            side: h.side,
            quantity: h.quantity,
            opened_at,
        });

        // Whatever rests on the symbol predates this state.
        self.gateway
            .cancel_all_orders(session.credentials(), &state.symbol)
            .await?;
        self.place_protection(session, &mut state, position.quantity)
            .await?;
        self.trailing.put(session.id(), state.clone());
        info!(
            user_id = session.id(),
            symbol = %state.symbol,
            side = %state.side,
            entry = %state.entry_price,
            stop_loss = %state.stop_loss,
            take_profit = %state.trailing_take_profit,
            "Seeded trailing state"
        );
        Ok(state)
    }

    /// Place a stop at the state's stop level and a take-profit at its
    /// trailing take-profit, recording both ids. If the take-profit is
    /// rejected the fresh stop is withdrawn and nothing is recorded.
    async fn place_protection(
        &self,
        session: &UserSession,
        state: &mut TrailingState,
        quantity: Decimal,
    ) -> Result<()> {
        session.ensure_active()?;
        let creds = session.credentials();

        let stop = OrderRequest::stop_loss(&state.symbol, state.side, quantity, state.stop_loss)
            .with_position_side(state.position_side);
        let stop_ack = self.gateway.submit_order(creds, stop).await?;

        let take_profit = OrderRequest::take_profit(
            &state.symbol,
            state.side,
            quantity,
            state.trailing_take_profit,
        )
        .with_position_side(state.position_side);
        match self.gateway.submit_order(creds, take_profit).await {
            Ok(tp_ack) => {
                state.stop_order_id = Some(stop_ack.order_id);
                state.take_profit_order_id = Some(tp_ack.order_id);
                state.protected_quantity = quantity;
                Ok(())
            }
            Err(e) => {
                self.withdraw(session, &state.symbol, [Some(stop_ack.order_id), None])
                    .await;
                Err(e)
            }
        }
    }

    /// Cancel replaced protective orders. Orders already gone are ignored.
    async fn withdraw(&self, session: &UserSession, symbol: &str, order_ids: [Option<i64>; 2]) {
        for order_id in order_ids.into_iter().flatten() {
            if let Err(e) = self
                .gateway
                .cancel_order(session.credentials(), symbol, order_id)
                .await
            {
                debug!(user_id = session.id(), symbol, order_id, error = %e, "Protective order not cancelled");
            }
        }
    }

    async fn tick(
        &self,
        session: &UserSession,
        settings: &Settings,
        mut state: TrailingState,
        legs: &Legs<'_>,
        price: Decimal,
    ) -> Result<()> {
        let user_id = session.id();
        let creds = session.credentials();
        let symbol = state.symbol.clone();
        let now = Utc::now();
        let mut remaining = legs.primary.quantity;

        if state.is_stagnant(
            now,
            price,
            ChronoDuration::minutes(settings.stagnation_minutes),
            settings.stagnation_move_pct,
        ) {
            let exit = self.close_managed(session, &state, legs, price).await?;
            self.events.emit(TradingEvent::StagnationClose {
                user_id: user_id.to_string(),
                symbol,
                price: exit,
                minutes_open: (now - state.opened_at).num_minutes(),
            });
            return Ok(());
        }

        if let Some(reason) = state.exit_trigger(price) {
            let exit = self.close_managed(session, &state, legs, price).await?;
            self.events.emit(TradingEvent::PositionClosed {
                user_id: user_id.to_string(),
                symbol: symbol.clone(),
                side: state.side,
                reason,
                exit_price: Some(exit),
                pnl: Some(state.pnl(exit, remaining)),
            });
            if state.favourable_move(exit).abs() <= settings.reentry_threshold_pct {
                self.re_enter(session, settings, &state, legs.primary.leverage, exit)
                    .await?;
            }
            return Ok(());
        }

        if let Some(level) = state.partial_due(price) {
            let info = self.gateway.fetch_symbol_info(creds, &symbol).await?;
            let quantity = info.floor_quantity(remaining / Decimal::from(3));
            if quantity > Decimal::ZERO && quantity >= info.min_qty {
                session.ensure_active()?;
                let order = OrderRequest::close(&symbol, state.side, quantity)
                    .with_position_side(state.position_side);
                self.gateway.submit_order(creds, order).await?;
                remaining -= quantity;
            } else {
                debug!(user_id, symbol = %symbol, "Partial below minimum quantity, marking level only");
            }
            state.mark_partial(level);
            self.trailing.put(user_id, state.clone());
            info!(user_id, symbol = %symbol, ?level, quantity = %quantity, "Partial take-profit");
            self.events.emit(TradingEvent::PartialTakeProfit {
                user_id: user_id.to_string(),
                symbol: symbol.clone(),
                level,
                quantity,
                price,
            });
        }

        let hedge_trigger =
            Decimal::from_f64(self.config.hedge_trigger_pct).unwrap_or(Decimal::new(1, 1));
        if state.needs_hedge(price, settings.hedging_enabled, hedge_trigger) {
            if state.position_side == PositionSide::Both {
                debug!(user_id, symbol = %symbol, "Hedging needs hedge-mode positions");
            } else {
                self.open_hedge(session, &mut state, remaining).await?;
            }
        }

        let mut next = state.clone();
        let moved = next.ratchet(price);
        let advanced = next.extreme_price != state.extreme_price;
        if advanced || state.protected_quantity != remaining || state.stop_order_id.is_none() {
            self.place_protection(session, &mut next, remaining).await?;
            self.withdraw(
                session,
                &symbol,
                [state.stop_order_id, state.take_profit_order_id],
            )
            .await;
            self.trailing.put(user_id, next.clone());
            if let Some(stop_loss) = moved {
                self.events.emit(TradingEvent::TrailingStopUpdated {
                    user_id: user_id.to_string(),
                    symbol,
                    stop_loss,
                    trailing_take_profit: next.trailing_take_profit,
                });
            }
        }
        Ok(())
    }

    async fn open_hedge(
        &self,
        session: &UserSession,
        state: &mut TrailingState,
        remaining: Decimal,
    ) -> Result<()> {
        let creds = session.credentials();
        let info = self.gateway.fetch_symbol_info(creds, &state.symbol).await?;
        let quantity = info.floor_quantity(remaining / Decimal::from(2));
        if quantity <= Decimal::ZERO || quantity < info.min_qty {
            debug!(symbol = %state.symbol, "Hedge below minimum quantity");
            return Ok(());
        }
        session.ensure_active()?;

        let side = state.side.opposite();
        let order = OrderRequest::open(&state.symbol, side, quantity)
            .with_position_side(PositionSide::for_side(side));
        self.gateway.submit_order(creds, order).await?;
        state.hedge = Some(HedgeRef {
            side,
            quantity,
            opened_at: Utc::now(),
        });
        self.trailing.put(session.id(), state.clone());

        info!(user_id = session.id(), symbol = %state.symbol, side = %side, quantity = %quantity, "Opened hedge");
        self.events.emit(TradingEvent::HedgeOpened {
            user_id: session.id().to_string(),
            symbol: state.symbol.clone(),
            side,
            quantity,
        });
        Ok(())
    }

    /// Market-close the primary leg and any hedge, clear resting orders,
    /// record the trade and drop the state. Returns the exit price.
    async fn close_managed(
        &self,
        session: &UserSession,
        state: &TrailingState,
        legs: &Legs<'_>,
        price: Decimal,
    ) -> Result<Decimal> {
        session.ensure_active()?;
        let user_id = session.id();
        let creds = session.credentials();
        let symbol = state.symbol.as_str();
        let quantity = legs.primary.quantity;

        let order = OrderRequest::close(symbol, state.side, quantity)
            .with_position_side(state.position_side);
        let ack = self.gateway.submit_order(creds, order).await?;
        let exit = ack
            .avg_price
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or(price);

        if let Some(hedge) = legs.hedge {
            let order = OrderRequest::close(symbol, hedge.side, hedge.quantity)
                .with_position_side(hedge.position_side);
            if let Err(e) = self.gateway.submit_order(creds, order).await {
                warn!(user_id, symbol, error = %e, "Failed to close hedge leg");
                self.events.emit(TradingEvent::Failure {
                    user_id: user_id.to_string(),
                    symbol: Some(symbol.to_string()),
                    message: format!("hedge left open: {}", e.user_message()),
                });
            }
        }
        if let Err(e) = self.gateway.cancel_all_orders(creds, symbol).await {
            warn!(user_id, symbol, error = %e, "Failed to cancel resting orders");
        }

        session
            .record_trade(TradeRecord::new(
                symbol,
                state.side,
                state.entry_price,
                exit,
                quantity,
                Utc::now(),
            ))
            .await;
        self.trailing.remove(user_id, symbol);
        info!(
            user_id,
            symbol,
            side = %state.side,
            entry = %state.entry_price,
            exit = %exit,
            "Closed position"
        );
        Ok(exit)
    }

    /// Same-direction entry after an exit close to the original entry, sized
    /// from a fresh balance.
    async fn re_enter(
        &self,
        session: &UserSession,
        settings: &Settings,
        closed: &TrailingState,
        leverage: u32,
        price: Decimal,
    ) -> Result<()> {
        session.ensure_active()?;
        let creds = session.credentials();
        let symbol = closed.symbol.as_str();

        let account = self.gateway.get_account(creds).await?;
        let info = self.gateway.fetch_symbol_info(creds, symbol).await?;
        let sizing = SizingInput {
            available: account.balance.available,
            base_fraction: settings.position_size_fraction,
            performance_ratio: session.performance_ratio().await,
            atr_ratio: self.atr_ratio(symbol, settings.timeframe).await,
            leverage,
            price,
        };
        let quantity = info.tradeable_quantity(sizing.raw_quantity())?;

        let order = OrderRequest::open(symbol, closed.side, quantity)
            .with_position_side(closed.position_side);
        let ack = self.gateway.submit_order(creds, order).await?;
        let fill = ack.avg_price.unwrap_or(price);

        info!(user_id = session.id(), symbol, side = %closed.side, quantity = %quantity, "Re-entered");
        self.events.emit(TradingEvent::ReEntry {
            user_id: session.id().to_string(),
            symbol: symbol.to_string(),
            side: closed.side,
            quantity,
            price: fill,
        });
        Ok(())
    }

    /// Market-close one symbol, or every open position when `symbol` is
    /// `None`. Returns the number of symbols closed.
    pub async fn close_positions(&self, session: &UserSession, symbol: Option<&str>) -> Result<usize> {
        session.ensure_active()?;
        let user_id = session.id();
        let account = self.gateway.get_account(session.credentials()).await?;

        let mut symbols: Vec<&str> = account
            .positions
            .iter()
            .map(|p| p.symbol.as_str())
            .filter(|s| symbol.map_or(true, |wanted| *s == wanted))
            .collect();
        symbols.sort_unstable();
        symbols.dedup();
        if let (Some(wanted), true) = (symbol, symbols.is_empty()) {
            return Err(Error::validation(format!("no open position on {wanted}")));
        }

        let mut closed = 0;
        for symbol in symbols {
            let Some(_guard) = self.in_flight.try_acquire(user_id, symbol) else {
                warn!(user_id, symbol, "Symbol busy, not closing");
                continue;
            };
            let existing = self.trailing.get(user_id, symbol);
            let Some(legs) = legs_for(&account, symbol, existing.as_ref()) else {
                continue;
            };
            let state = match existing {
                Some(state) if matches_exchange(&state, legs.primary) => state,
                _ => TrailingState::seed(
                    symbol,
                    legs.primary.side,
                    legs.primary.position_side,
                    legs.primary.entry_price,
                    legs.primary.quantity,
                    TrailingParams::default(),
                    Utc::now(),
                ),
            };

            let exit = self
                .close_managed(session, &state, &legs, legs.primary.mark_price)
                .await?;
            self.events.emit(TradingEvent::PositionClosed {
                user_id: user_id.to_string(),
                symbol: symbol.to_string(),
                side: state.side,
                reason: ExitReason::Manual,
                exit_price: Some(exit),
                pnl: Some(state.pnl(exit, legs.primary.quantity)),
            });
            closed += 1;
        }
        Ok(closed)
    }
}
