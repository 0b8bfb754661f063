//! Exchange precision rules.
//!
//! Order quantities and prices are always floored to the exchange's step and
//! tick sizes. Rounding to nearest can produce a value above the true floor,
//! which the exchange rejects.

use rust_decimal::Decimal;

/// Floor `value` to a multiple of `step`.
///
/// A non-positive step means the symbol has no granularity constraint and the
/// value is returned unchanged.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).floor() * step).normalize()
}

/// Whether `value` is an exact multiple of `step`.
pub fn is_multiple_of(value: Decimal, step: Decimal) -> bool {
    if step <= Decimal::ZERO {
        return true;
    }
    (value % step).is_zero()
}

/// Number of decimal places implied by a step size (0.001 -> 3).
pub fn step_decimals(step: Decimal) -> u32 {
    step.normalize().scale()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_floor_not_round() {
        assert_eq!(floor_to_step(d("12.345"), d("0.01")), d("12.34"));
        assert_eq!(floor_to_step(d("12.349"), d("0.01")), d("12.34"));
        assert_eq!(floor_to_step(d("0.0999"), d("0.1")), Decimal::ZERO);
    }

    #[test]
    fn test_floor_whole_steps() {
        assert_eq!(floor_to_step(d("157"), d("5")), d("155"));
        assert_eq!(floor_to_step(d("1.5"), d("1")), d("1"));
    }

    #[test]
    fn test_floor_idempotent_and_bounded() {
        let steps = ["0.001", "0.01", "0.5", "1", "10"];
        let values = ["0.0004", "3.14159", "12.345", "999.999", "10000"];
        for s in steps {
            for v in values {
                let (step, value) = (d(s), d(v));
                let once = floor_to_step(value, step);
                assert_eq!(floor_to_step(once, step), once);
                assert!(once <= value);
                assert!(is_multiple_of(once, step));
            }
        }
    }

    #[test]
    fn test_zero_step_passthrough() {
        assert_eq!(floor_to_step(d("1.23456"), Decimal::ZERO), d("1.23456"));
    }

    #[test]
    fn test_step_decimals() {
        assert_eq!(step_decimals(d("0.00100000")), 3);
        assert_eq!(step_decimals(d("1.0")), 0);
    }
}
