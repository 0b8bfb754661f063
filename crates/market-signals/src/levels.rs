//! Support/resistance levels and the price-action patterns tested against them.

use exchange_core::types::Candle;
use serde::{Deserialize, Serialize};

/// Number of levels kept on each side.
pub const LEVEL_COUNT: usize = 3;

/// Distance from a level, as a fraction of the level, still counted as a touch.
pub const LEVEL_TOLERANCE: f64 = 0.01;

/// Minimum wick share of the bar's range for a bounce or rejection.
pub const WICK_RATIO: f64 = 0.5;

/// Bars scanned for a breakout high/low.
pub const BREAKOUT_LOOKBACK: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Levels {
    /// Lowest distinct lows, ascending.
    pub support: Vec<f64>,
    /// Highest distinct highs, descending.
    pub resistance: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Breakout {
    Upside,
    Downside,
}

/// Levels from every bar before the last one, so the bar under test never
/// defines its own level.
pub fn support_resistance(candles: &[Candle]) -> Levels {
    let Some((_, history)) = candles.split_last() else {
        return Levels::default();
    };

    let mut lows: Vec<f64> = history.iter().map(|c| c.low).filter(|v| v.is_finite()).collect();
    lows.sort_by(|a, b| a.total_cmp(b));
    lows.dedup();
    lows.truncate(LEVEL_COUNT);

    let mut highs: Vec<f64> = history.iter().map(|c| c.high).filter(|v| v.is_finite()).collect();
    highs.sort_by(|a, b| b.total_cmp(a));
    highs.dedup();
    highs.truncate(LEVEL_COUNT);

    Levels {
        support: lows,
        resistance: highs,
    }
}

fn near(price: f64, level: f64) -> bool {
    level > 0.0 && ((price - level) / level).abs() <= LEVEL_TOLERANCE
}

/// Bullish bar whose low tags a support level and whose lower wick dominates
/// the range.
pub fn is_support_bounce(candle: &Candle, levels: &Levels) -> bool {
    let range = candle.range();
    if range <= 0.0 || !candle.is_bullish() {
        return false;
    }
    let lower_wick = candle.open.min(candle.close) - candle.low;
    lower_wick / range > WICK_RATIO && levels.support.iter().any(|&l| near(candle.low, l))
}

/// Bearish bar whose high tags a resistance level and whose upper wick
/// dominates the range.
pub fn is_resistance_rejection(candle: &Candle, levels: &Levels) -> bool {
    let range = candle.range();
    if range <= 0.0 || !candle.is_bearish() {
        return false;
    }
    let upper_wick = candle.high - candle.open.max(candle.close);
    upper_wick / range > WICK_RATIO && levels.resistance.iter().any(|&l| near(candle.high, l))
}

/// Close of the last bar beyond the extreme of the preceding lookback window.
pub fn breakout(candles: &[Candle], lookback: usize) -> Option<Breakout> {
    let (last, history) = candles.split_last()?;
    if history.is_empty() || lookback == 0 {
        return None;
    }
    let window = &history[history.len().saturating_sub(lookback)..];
    let high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);

    if last.close > high {
        Some(Breakout::Upside)
    } else if last.close < low {
        Some(Breakout::Downside)
    } else {
        None
    }
}
