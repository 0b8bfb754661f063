use exchange_core::types::Candle;
use serde::{Deserialize, Serialize};

/// Fewest bars for which return statistics are meaningful.
pub const MIN_ANOMALY_CANDLES: usize = 10;
pub const PRICE_SHOCK_ZSCORE: f64 = 4.0;
pub const VOLUME_SPIKE_RATIO: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Anomaly {
    PriceShock { zscore: f64 },
    VolumeSpike { ratio: f64 },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::PriceShock { zscore } => write!(f, "price shock ({zscore:.1}σ)"),
            Anomaly::VolumeSpike { ratio } => write!(f, "volume spike ({ratio:.1}x)"),
        }
    }
}

/// Checks the last bar against the statistics of the bars before it.
pub fn detect(candles: &[Candle]) -> Option<Anomaly> {
    if candles.len() < MIN_ANOMALY_CANDLES {
        return None;
    }
    let (last, history) = candles.split_last()?;

    let returns: Vec<f64> = history
        .windows(2)
        .filter(|w| w[0].close > 0.0)
        .map(|w| w[1].close / w[0].close - 1.0)
        .collect();
    let prev_close = history.last()?.close;

    if !returns.is_empty() && prev_close > 0.0 {
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let sigma = (returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt();
        let last_return = last.close / prev_close - 1.0;
        if sigma > 0.0 {
            let zscore = (last_return - mean) / sigma;
            if zscore.abs() > PRICE_SHOCK_ZSCORE {
                return Some(Anomaly::PriceShock { zscore });
            }
        }
    }

    let mean_volume = history.iter().map(|c| c.volume).sum::<f64>() / history.len() as f64;
    if mean_volume > 0.0 {
        let ratio = last.volume / mean_volume;
        if ratio > VOLUME_SPIKE_RATIO {
            return Some(Anomaly::VolumeSpike { ratio });
        }
    }

    None
}
