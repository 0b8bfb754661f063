use exchange_core::types::{Candle, OrderBookSnapshot};

/// Volume ratio at which participation counts as strong.
pub const STRONG_VOLUME_RATIO: f64 = 1.5;

/// Bars averaged for the volume baseline.
pub const VOLUME_LOOKBACK: usize = 20;

/// Last bar's volume over the mean of the preceding `lookback` bars.
///
/// Returns 0.0 when there is no baseline to compare against.
pub fn volume_strength(candles: &[Candle], lookback: usize) -> f64 {
    let Some((last, history)) = candles.split_last() else {
        return 0.0;
    };
    let window = &history[history.len().saturating_sub(lookback)..];
    if window.is_empty() {
        return 0.0;
    }
    let mean = window.iter().map(|c| c.volume).sum::<f64>() / window.len() as f64;
    if mean <= 0.0 || !mean.is_finite() {
        return 0.0;
    }
    last.volume / mean
}

pub fn is_strong_volume(ratio: f64) -> bool {
    ratio >= STRONG_VOLUME_RATIO
}

/// Bid/ask imbalance in [-1, 1]; positive when bids dominate.
pub fn book_pressure(book: &OrderBookSnapshot) -> f64 {
    let bids = book.bid_volume();
    let asks = book.ask_volume();
    let total = bids + asks;
    if total <= 0.0 || !total.is_finite() {
        return 0.0;
    }
    ((bids - asks) / total).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::series;
    use chrono::Utc;
    use exchange_core::types::PriceLevel;
    use rust_decimal::Decimal;

    #[test]
    fn test_volume_strength() {
        let mut candles = series(&[100.0; 21]);
        candles[20].volume = 3000.0;
        let ratio = volume_strength(&candles, VOLUME_LOOKBACK);
        assert!((ratio - 3.0).abs() < 1e-9);
        assert!(is_strong_volume(ratio));

        candles[20].volume = 1000.0;
        assert!(!is_strong_volume(volume_strength(&candles, VOLUME_LOOKBACK)));

        assert_eq!(volume_strength(&candles[..1], VOLUME_LOOKBACK), 0.0);
    }

    #[test]
    fn test_book_pressure() {
        let level = |price: i64, qty: i64| PriceLevel {
            price: Decimal::from(price),
            quantity: Decimal::from(qty),
        };
        let book = OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            timestamp: Utc::now(),
            bids: vec![level(100, 30), level(99, 10)],
            asks: vec![level(101, 10)],
        };
        assert!((book_pressure(&book) - 0.6).abs() < 1e-9);

        let empty = OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            timestamp: Utc::now(),
            bids: vec![],
            asks: vec![],
        };
        assert_eq!(book_pressure(&empty), 0.0);
    }
}
