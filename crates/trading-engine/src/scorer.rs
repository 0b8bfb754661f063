//! Opportunity scoring.
//!
//! A symbol is only a candidate once an entry rule fires. Its score is a sum
//! of bounded contributions, each capped at its weight, clamped to [0, 1].

use exchange_core::types::Side;
use market_signals::{Breakout, EntryRule, SignalSet};
use serde::Serialize;

pub const W_OSCILLATOR: f64 = 0.15;
pub const W_BAND_BREACH: f64 = 0.10;
pub const W_MACD: f64 = 0.05;
pub const W_CROSSOVER: f64 = 0.05;
pub const W_PATTERN: f64 = 0.10;
pub const W_VOLUME: f64 = 0.10;
pub const W_BOOK: f64 = 0.05;
pub const W_SENTIMENT: f64 = 0.10;
pub const W_VOLATILITY: f64 = 0.05;
pub const W_PREDICTION: f64 = 0.05;
pub const W_PERFORMANCE: f64 = 0.05;
pub const W_TIMEFRAMES: f64 = 0.10;

const VOLUME_SATURATION: f64 = 3.0;
const ATR_NORMALISER: f64 = 0.02;
const PREDICTION_NORMALISER: f64 = 0.01;

/// Inputs that do not come from the symbol's own candle series.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MarketContext {
    pub sentiment: f64,
    pub book_pressure: f64,
    pub timeframe_bias: f64,
    pub performance_ratio: f64,
}

/// Per-input contributions, kept for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ScoreBreakdown {
    pub oscillator: f64,
    pub band_breach: f64,
    pub macd: f64,
    pub crossover: f64,
    pub pattern: f64,
    pub volume: f64,
    pub book: f64,
    pub sentiment: f64,
    pub volatility: f64,
    pub prediction: f64,
    pub performance: f64,
    pub timeframes: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        let sum = self.oscillator
            + self.band_breach
            + self.macd
            + self.crossover
            + self.pattern
            + self.volume
            + self.book
            + self.sentiment
            + self.volatility
            + self.prediction
            + self.performance
            + self.timeframes;
        if sum.is_finite() {
            sum.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// `weight · clamp(x, 0, 1)`, or nothing for a non-finite input.
fn part(weight: f64, x: f64) -> f64 {
    if x.is_finite() {
        weight * x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn flag(weight: f64, on: bool) -> f64 {
    if on {
        weight
    } else {
        0.0
    }
}

pub fn score(signals: &SignalSet, context: &MarketContext, bias: Side) -> ScoreBreakdown {
    let snap = &signals.snapshot;

    let rsi_extremity = if snap.rsi < 30.0 {
        (30.0 - snap.rsi) / 30.0
    } else if snap.rsi > 70.0 {
        (snap.rsi - 70.0) / 30.0
    } else {
        0.0
    };

    let macd_agrees = match bias {
        Side::Long => snap.macd_histogram > 0.0,
        Side::Short => snap.macd_histogram < 0.0,
    };

    let pattern = match bias {
        Side::Long => signals.support_bounce || signals.breakout == Some(Breakout::Upside),
        Side::Short => {
            signals.resistance_rejection || signals.breakout == Some(Breakout::Downside)
        }
    };

    let volume = if signals.volume_ratio >= market_signals::flow::STRONG_VOLUME_RATIO {
        part(W_VOLUME, signals.volume_ratio / VOLUME_SATURATION)
    } else {
        0.0
    };

    ScoreBreakdown {
        oscillator: part(W_OSCILLATOR, rsi_extremity),
        band_breach: flag(
            W_BAND_BREACH,
            snap.below_lower_band() || snap.above_upper_band(),
        ),
        macd: flag(W_MACD, macd_agrees),
        crossover: flag(W_CROSSOVER, snap.crossover().is_some()),
        pattern: flag(W_PATTERN, pattern),
        volume,
        book: part(W_BOOK, context.book_pressure.abs()),
        sentiment: part(W_SENTIMENT, context.sentiment.abs()),
        volatility: part(W_VOLATILITY, snap.atr_ratio() / ATR_NORMALISER),
        prediction: part(W_PREDICTION, signals.predicted_delta.abs() / PREDICTION_NORMALISER),
        performance: part(W_PERFORMANCE, context.performance_ratio / 2.0),
        timeframes: part(W_TIMEFRAMES, context.timeframe_bias.abs()),
    }
}

/// Sentiment running against `side` by more than `threshold`.
pub fn sentiment_opposes(side: Side, sentiment: f64, threshold: f64) -> bool {
    match side {
        Side::Long => sentiment < -threshold,
        Side::Short => sentiment > threshold,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub symbol: String,
    pub side: Side,
    pub rule: EntryRule,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub close: f64,
    pub atr_ratio: f64,
    pub sentiment: f64,
}

impl Opportunity {
    pub fn new(symbol: &str, rule: EntryRule, signals: &SignalSet, context: &MarketContext) -> Self {
        let side = rule.side();
        let breakdown = score(signals, context, side);
        Self {
            symbol: symbol.to_string(),
            side,
            rule,
            score: breakdown.total(),
            breakdown,
            close: signals.snapshot.close(),
            atr_ratio: signals.snapshot.atr_ratio(),
            sentiment: context.sentiment,
        }
    }
}

/// Highest score first; ties keep symbol order for determinism.
pub fn rank(mut opportunities: Vec<Opportunity>) -> Vec<Opportunity> {
    opportunities.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    opportunities
}
