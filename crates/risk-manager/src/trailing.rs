//! Trailing stop / take-profit state for one open position.
//!
//! A [`TrailingState`] is seeded from the exchange's entry price on first
//! observation and then advanced tick by tick. The stop-loss only ever moves in
//! the profit-protecting direction; partial take-profit flags only ever go
//! from `false` to `true`.

use chrono::{DateTime, Duration, Utc};
use exchange_core::types::{PositionSide, Settings, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Percentages that shape a position's protective levels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingParams {
    pub stop_loss_pct: Decimal,
    pub take_profit1_pct: Decimal,
    pub take_profit2_pct: Decimal,
    pub trailing_take_profit_pct: Decimal,
}

impl Default for TrailingParams {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for TrailingParams {
    fn from(settings: &Settings) -> Self {
        Self {
            stop_loss_pct: settings.stop_loss_pct,
            take_profit1_pct: settings.take_profit1_pct,
            take_profit2_pct: settings.take_profit2_pct,
            trailing_take_profit_pct: settings.trailing_take_profit_pct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingTakeProfit,
    Stagnation,
    Manual,
    /// Position vanished from the exchange without a local close.
    External,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop-loss",
            ExitReason::TrailingTakeProfit => "trailing take-profit",
            ExitReason::Stagnation => "stagnation",
            ExitReason::Manual => "manual",
            ExitReason::External => "external",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartialLevel {
    First,
    Second,
}

/// The opposite-side position opened to cap an adverse move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeRef {
    pub side: Side,
    pub quantity: Decimal,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingState {
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub entry_price: Decimal,
    /// Quantity when the state was seeded.
    pub initial_quantity: Decimal,
    pub stop_loss: Decimal,
    pub take_profit1: Decimal,
    pub take_profit2: Decimal,
    pub trailing_take_profit: Decimal,
    /// Most favourable price seen since seeding.
    pub extreme_price: Decimal,
    pub partial_closed1: bool,
    pub partial_closed2: bool,
    pub opened_at: DateTime<Utc>,
    pub hedge: Option<HedgeRef>,
    /// Exchange id of the live stop-market order.
    pub stop_order_id: Option<i64>,
    pub take_profit_order_id: Option<i64>,
    /// Quantity the resting protective orders cover.
    pub protected_quantity: Decimal,
    pub params: TrailingParams,
}

impl TrailingState {
    pub fn seed(
        symbol: &str,
        side: Side,
        position_side: PositionSide,
        entry_price: Decimal,
        quantity: Decimal,
        params: TrailingParams,
        opened_at: DateTime<Utc>,
    ) -> Self {
        let sign = side.sign();
        let offset = |pct: Decimal| entry_price * (Decimal::ONE + sign * pct);

        Self {
            symbol: symbol.to_string(),
            side,
            position_side,
            entry_price,
            initial_quantity: quantity,
            stop_loss: entry_price * (Decimal::ONE - sign * params.stop_loss_pct),
            take_profit1: offset(params.take_profit1_pct),
            take_profit2: offset(params.take_profit2_pct),
            trailing_take_profit: offset(params.trailing_take_profit_pct),
            extreme_price: entry_price,
            partial_closed1: false,
            partial_closed2: false,
            opened_at,
            hedge: None,
            stop_order_id: None,
            take_profit_order_id: None,
            protected_quantity: Decimal::ZERO,
            params,
        }
    }

    /// `a` is at or beyond `b` in the position's favour.
    fn at_or_beyond(&self, a: Decimal, b: Decimal) -> bool {
        match self.side {
            Side::Long => a >= b,
            Side::Short => a <= b,
        }
    }

    pub fn stop_hit(&self, price: Decimal) -> bool {
        self.at_or_beyond(self.stop_loss, price)
    }

    pub fn trailing_take_profit_hit(&self, price: Decimal) -> bool {
        self.at_or_beyond(price, self.trailing_take_profit)
    }

    pub fn exit_trigger(&self, price: Decimal) -> Option<ExitReason> {
        if self.stop_hit(price) {
            Some(ExitReason::StopLoss)
        } else if self.trailing_take_profit_hit(price) {
            Some(ExitReason::TrailingTakeProfit)
        } else {
            None
        }
    }

    /// The next partial take-profit level crossed by `price`, if any.
    ///
    /// The second level is only considered once the first has been taken.
    pub fn partial_due(&self, price: Decimal) -> Option<PartialLevel> {
        if !self.partial_closed1 {
            return self
                .at_or_beyond(price, self.take_profit1)
                .then_some(PartialLevel::First);
        }
        if !self.partial_closed2 && self.at_or_beyond(price, self.take_profit2) {
            return Some(PartialLevel::Second);
        }
        None
    }

    pub fn mark_partial(&mut self, level: PartialLevel) {
        match level {
            PartialLevel::First => self.partial_closed1 = true,
            PartialLevel::Second => self.partial_closed2 = true,
        }
    }

    /// Signed move from entry as a fraction; positive is in the position's
    /// favour.
    pub fn favourable_move(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price * self.side.sign()
    }

    pub fn adverse_move(&self, price: Decimal) -> Decimal {
        -self.favourable_move(price)
    }

    pub fn needs_hedge(&self, price: Decimal, enabled: bool, trigger: Decimal) -> bool {
        enabled && self.hedge.is_none() && self.adverse_move(price) > trigger
    }

    pub fn is_stagnant(
        &self,
        now: DateTime<Utc>,
        price: Decimal,
        after: Duration,
        min_move: Decimal,
    ) -> bool {
        now - self.opened_at > after && self.favourable_move(price).abs() < min_move
    }

    /// Advance the trailing levels on a new favourable extreme.
    ///
    /// Returns the new stop when it moved. The stop is recomputed from the
    /// current price and never loosened.
    pub fn ratchet(&mut self, price: Decimal) -> Option<Decimal> {
        if !self.at_or_beyond(price, self.extreme_price) || price == self.extreme_price {
            return None;
        }
        let sign = self.side.sign();
        self.extreme_price = price;
        self.trailing_take_profit = price * (Decimal::ONE + sign * self.params.trailing_take_profit_pct);

        let candidate = price * (Decimal::ONE - sign * self.params.stop_loss_pct);
        if self.at_or_beyond(candidate, self.stop_loss) && candidate != self.stop_loss {
            debug!(
                symbol = %self.symbol,
                old_stop = %self.stop_loss,
                new_stop = %candidate,
                "Ratcheted trailing stop"
            );
            self.stop_loss = candidate;
            Some(candidate)
        } else {
            None
        }
    }

    /// Realized PnL of closing `quantity` at `exit`.
    pub fn pnl(&self, exit: Decimal, quantity: Decimal) -> Decimal {
        (exit - self.entry_price) * quantity * self.side.sign()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn long(entry: Decimal) -> TrailingState {
        TrailingState::seed(
            "BTCUSDT",
            Side::Long,
            PositionSide::Both,
            entry,
            d("1"),
            TrailingParams::default(),
            Utc::now(),
        )
    }

    fn short(entry: Decimal) -> TrailingState {
        TrailingState::seed(
            "BTCUSDT",
            Side::Short,
            PositionSide::Both,
            entry,
            d("1"),
            TrailingParams::default(),
            Utc::now(),
        )
    }

    #[test]
    fn test_seed_levels() {
        let state = long(d("100"));
        assert_eq!(state.stop_loss, d("98"));
        assert_eq!(state.take_profit1, d("103"));
        assert_eq!(state.take_profit2, d("106"));
        assert_eq!(state.trailing_take_profit, d("110"));

        let state = short(d("100"));
        assert_eq!(state.stop_loss, d("102"));
        assert_eq!(state.take_profit1, d("97"));
        assert_eq!(state.trailing_take_profit, d("90"));
    }

    #[test]
    fn test_ratchet_long() {
        let mut state = long(d("100"));
        assert_eq!(state.ratchet(d("110")), Some(d("107.8")));
        assert_eq!(state.extreme_price, d("110"));
        assert_eq!(state.trailing_take_profit, d("121"));

        // Pullback leaves everything in place.
        assert_eq!(state.ratchet(d("108")), None);
        assert_eq!(state.stop_loss, d("107.8"));
        assert_eq!(state.extreme_price, d("110"));
    }

    #[test]
    fn test_stop_monotone_over_ticks() {
        let prices = [101, 99, 104, 103, 107, 102, 111, 95, 112];
        let mut state = long(d("100"));
        let mut last_stop = state.stop_loss;
        for p in prices {
            state.ratchet(Decimal::from(p));
            assert!(state.stop_loss >= last_stop);
            last_stop = state.stop_loss;
        }

        let mut state = short(d("100"));
        let mut last_stop = state.stop_loss;
        for p in prices.iter().map(|p| 200 - p) {
            state.ratchet(Decimal::from(p));
            assert!(state.stop_loss <= last_stop);
            last_stop = state.stop_loss;
        }
    }

    #[test]
    fn test_exit_triggers() {
        let state = long(d("100"));
        assert_eq!(state.exit_trigger(d("97.5")), Some(ExitReason::StopLoss));
        assert_eq!(state.exit_trigger(d("98")), Some(ExitReason::StopLoss));
        assert_eq!(state.exit_trigger(d("110")), Some(ExitReason::TrailingTakeProfit));
        assert_eq!(state.exit_trigger(d("105")), None);

        let state = short(d("100"));
        assert_eq!(state.exit_trigger(d("102.5")), Some(ExitReason::StopLoss));
        assert_eq!(state.exit_trigger(d("89")), Some(ExitReason::TrailingTakeProfit));
    }

    #[test]
    fn test_partial_levels_in_order() {
        let mut state = long(d("100"));
        assert_eq!(state.partial_due(d("102")), None);
        // Price through both levels still takes the first one first.
        assert_eq!(state.partial_due(d("107")), Some(PartialLevel::First));
        state.mark_partial(PartialLevel::First);
        assert_eq!(state.partial_due(d("104")), None);
        assert_eq!(state.partial_due(d("107")), Some(PartialLevel::Second));
        state.mark_partial(PartialLevel::Second);
        assert_eq!(state.partial_due(d("120")), None);

        state.mark_partial(PartialLevel::First);
        assert!(state.partial_closed1 && state.partial_closed2);
    }

    #[test]
    fn test_hedge_and_stagnation() {
        let mut state = long(d("100"));
        assert!(!state.needs_hedge(d("89"), false, d("0.10")));
        assert!(!state.needs_hedge(d("91"), true, d("0.10")));
        assert!(state.needs_hedge(d("89"), true, d("0.10")));
        state.hedge = Some(HedgeRef {
            side: Side::Short,
            quantity: d("0.5"),
            opened_at: Utc::now(),
        });
        assert!(!state.needs_hedge(d("80"), true, d("0.10")));

        let now = state.opened_at + Duration::minutes(241);
        assert!(state.is_stagnant(now, d("100.5"), Duration::minutes(240), d("0.01")));
        assert!(!state.is_stagnant(now, d("101.5"), Duration::minutes(240), d("0.01")));
        assert!(!state.is_stagnant(
            state.opened_at + Duration::minutes(30),
            d("100"),
            Duration::minutes(240),
            d("0.01")
        ));
    }

    #[test]
    fn test_pnl_signs() {
        assert_eq!(long(d("100")).pnl(d("110"), d("2")), d("20"));
        assert_eq!(short(d("100")).pnl(d("110"), d("2")), d("-20"));
    }
}
