//! Leverage and position size from score, volatility and track record.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// ATR/price at which the volatility factor is neutral.
pub const TARGET_ATR_RATIO: f64 = 0.02;

/// Leverage interpolated between the user minimum and the symbol maximum by
/// the square of the score, then clamped to both ceilings.
pub fn leverage_for_score(score: f64, min_leverage: u32, user_max: u32, symbol_max: u32) -> u32 {
    let score = if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let span = symbol_max.saturating_sub(min_leverage) as f64;
    let raw = (min_leverage as f64 + span * score * score).floor() as u32;
    raw.min(user_max).min(symbol_max).max(1)
}

pub fn performance_scale(ratio: f64) -> f64 {
    if ratio.is_finite() {
        ratio.clamp(0.5, 2.0)
    } else {
        1.0
    }
}

/// Shrinks size in volatile markets and grows it in quiet ones.
pub fn volatility_factor(atr_ratio: f64) -> f64 {
    if atr_ratio.is_nan() || atr_ratio < 0.0 {
        return 1.0;
    }
    if atr_ratio == 0.0 {
        return 1.5;
    }
    (TARGET_ATR_RATIO / atr_ratio).clamp(0.5, 1.5)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingInput {
    pub available: Decimal,
    pub base_fraction: Decimal,
    pub performance_ratio: f64,
    pub atr_ratio: f64,
    pub leverage: u32,
    pub price: Decimal,
}

impl SizingInput {
    pub fn margin(&self) -> Decimal {
        let scale = performance_scale(self.performance_ratio) * volatility_factor(self.atr_ratio);
        let scale = Decimal::from_f64(scale).unwrap_or(Decimal::ONE);
        (self.available * self.base_fraction * scale).max(Decimal::ZERO)
    }

    /// Quantity before step flooring; zero when the price is unusable.
    pub fn raw_quantity(&self) -> Decimal {
        if self.price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.margin() * Decimal::from(self.leverage) / self.price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leverage_interpolation() {
        assert_eq!(leverage_for_score(0.0, 25, 125, 125), 25);
        assert_eq!(leverage_for_score(1.0, 25, 125, 125), 125);
        // 25 + 100 * 0.25
        assert_eq!(leverage_for_score(0.5, 25, 125, 125), 50);
        assert_eq!(leverage_for_score(1.0, 25, 50, 125), 50);
        assert_eq!(leverage_for_score(1.0, 25, 125, 75), 75);
        assert_eq!(leverage_for_score(f64::NAN, 25, 125, 125), 25);
        // Symbol ceiling wins over a higher user minimum.
        assert_eq!(leverage_for_score(0.5, 50, 125, 20), 20);
    }

    #[test]
    fn test_factors_clamped() {
        assert_eq!(performance_scale(5.0), 2.0);
        assert_eq!(performance_scale(-1.0), 0.5);
        assert_eq!(performance_scale(f64::INFINITY), 1.0);

        assert_eq!(volatility_factor(0.02), 1.0);
        assert_eq!(volatility_factor(0.1), 0.5);
        assert_eq!(volatility_factor(0.001), 1.5);
        assert_eq!(volatility_factor(0.0), 1.5);
        assert_eq!(volatility_factor(f64::NAN), 1.0);
    }

    #[test]
    fn test_margin_and_quantity() {
        let input = SizingInput {
            available: Decimal::from(1000),
            base_fraction: Decimal::new(5, 2),
            performance_ratio: 1.0,
            atr_ratio: 0.02,
            leverage: 20,
            price: Decimal::from(100),
        };
        assert_eq!(input.margin(), Decimal::from(50));
        assert_eq!(input.raw_quantity(), Decimal::from(10));

        let volatile = SizingInput {
            atr_ratio: 0.04,
            ..input
        };
        assert_eq!(volatile.margin(), Decimal::from(25));

        let no_price = SizingInput {
            price: Decimal::ZERO,
            ..input
        };
        assert_eq!(no_price.raw_quantity(), Decimal::ZERO);
    }
}
