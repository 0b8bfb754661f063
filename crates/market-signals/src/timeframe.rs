//! Multi-timeframe directional confirmation.

use crate::indicators::IndicatorSnapshot;

fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Trend bias of one timeframe in [-1, 1]: the mean of the EMA alignment and
/// the close's side of the SMA.
pub fn trend_bias(snapshot: &IndicatorSnapshot) -> f64 {
    let ema = sign(snapshot.ema_fast - snapshot.ema_slow);
    let sma = sign(snapshot.close() - snapshot.sma);
    (ema + sma) / 2.0
}

/// Mean bias across timeframes; 0.0 when none could be computed.
pub fn average_bias(biases: &[f64]) -> f64 {
    let finite: Vec<f64> = biases.iter().copied().filter(|b| b.is_finite()).collect();
    if finite.is_empty() {
        return 0.0;
    }
    (finite.iter().sum::<f64>() / finite.len() as f64).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorParams;
    use crate::test_support::series;

    #[test]
    fn test_trend_bias_follows_direction() {
        let up: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let snap = IndicatorSnapshot::compute(&series(&up), &IndicatorParams::default()).unwrap();
        assert_eq!(trend_bias(&snap), 1.0);

        let down: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        let snap = IndicatorSnapshot::compute(&series(&down), &IndicatorParams::default()).unwrap();
        assert_eq!(trend_bias(&snap), -1.0);
    }

    #[test]
    fn test_average_bias() {
        assert_eq!(average_bias(&[]), 0.0);
        assert_eq!(average_bias(&[1.0, 0.0, 0.5, f64::NAN]), 0.5);
        assert_eq!(average_bias(&[-1.0, -0.5]), -0.75);
    }
}
