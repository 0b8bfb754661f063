//! Market Signals Library
//!
//! Pure, deterministic signal computation over candle series: indicator
//! snapshots, support/resistance patterns, volume and order-book flow, a naive
//! price predictor, multi-timeframe bias and anomaly detection.

pub mod anomaly;
pub mod error;
pub mod flow;
pub mod indicators;
pub mod levels;
pub mod predictor;
pub mod rules;
pub mod timeframe;

pub use anomaly::Anomaly;
pub use error::{Result, SignalError};
pub use indicators::{Crossover, IndicatorParams, IndicatorSnapshot};
pub use levels::{Breakout, Levels};
pub use rules::EntryRule;

use exchange_core::types::Candle;
use tracing::trace;

/// Everything derivable from a single candle series.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSet {
    pub snapshot: IndicatorSnapshot,
    pub levels: Levels,
    pub support_bounce: bool,
    pub resistance_rejection: bool,
    pub breakout: Option<Breakout>,
    pub volume_ratio: f64,
    pub predicted_delta: f64,
    pub anomaly: Option<Anomaly>,
}

impl SignalSet {
    pub fn compute(candles: &[Candle], params: &IndicatorParams) -> Result<Self> {
        let snapshot = IndicatorSnapshot::compute(candles, params)?;
        let levels = levels::support_resistance(candles);
        let last = snapshot.last;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let signals = SignalSet {
            support_bounce: levels::is_support_bounce(&last, &levels),
            resistance_rejection: levels::is_resistance_rejection(&last, &levels),
            breakout: levels::breakout(candles, levels::BREAKOUT_LOOKBACK),
            volume_ratio: flow::volume_strength(candles, flow::VOLUME_LOOKBACK),
            predicted_delta: predictor::predicted_delta(&closes, predictor::PREDICTION_WINDOW),
            anomaly: anomaly::detect(candles),
            snapshot,
            levels,
        };
        trace!(
            rsi = signals.snapshot.rsi,
            volume_ratio = signals.volume_ratio,
            "Computed signal set"
        );
        Ok(signals)
    }

    pub fn entry_rule(&self) -> Option<EntryRule> {
        EntryRule::evaluate(self)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{bar, series};
    use super::*;

    #[test]
    fn test_flat_market_has_no_entry() {
        let signals = test_support::flat_signals();
        assert_eq!(signals.entry_rule(), None);
        assert_eq!(signals.anomaly, None);
        assert_eq!(signals.breakout, None);
        assert!((signals.volume_ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_capitulation_bar_fires_long_rule() {
        // Steady decline, then a heavy-volume bar that flushes through the
        // lower band.
        let closes: Vec<f64> = (0..45).map(|i| 100.0 - 0.5 * i as f64).collect();
        let mut candles = series(&closes);
        let prev = candles[candles.len() - 1].close;
        candles.push(bar(prev, prev * 1.001, prev * 0.92, prev * 0.95, 2500.0));

        let signals = SignalSet::compute(&candles, &IndicatorParams::default()).unwrap();
        assert!(signals.snapshot.rsi <= rules::RSI_OVERSOLD);
        assert!(signals.volume_ratio >= flow::STRONG_VOLUME_RATIO);
        assert_eq!(signals.entry_rule(), Some(EntryRule::LongAtSupport));
        assert_eq!(signals.breakout, Some(Breakout::Downside));
    }
}
