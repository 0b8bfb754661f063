//! Indicator snapshot over a candle series.
//!
//! Every indicator is fed the full series once; the snapshot keeps the last
//! value of each and, where crossovers matter, the value one bar earlier.

use exchange_core::types::Candle;
use serde::{Deserialize, Serialize};
use ta::indicators::{
    AverageTrueRange, BollingerBands, ExponentialMovingAverage, MovingAverageConvergenceDivergence,
    RelativeStrengthIndex, SimpleMovingAverage,
};
use ta::{DataItem, Next};

use crate::error::{Result, SignalError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorParams {
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bb_period: usize,
    pub bb_multiplier: f64,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub sma_period: usize,
    pub atr_period: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            rsi_period: 7,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bb_period: 20,
            bb_multiplier: 2.0,
            ema_fast: 9,
            ema_slow: 21,
            sma_period: 20,
            atr_period: 14,
        }
    }
}

impl IndicatorParams {
    /// Shortest series for which every indicator has warmed up.
    pub fn min_candles(&self) -> usize {
        [
            self.macd_slow + self.macd_signal,
            self.bb_period,
            self.ema_slow + 1,
            self.sma_period,
            self.atr_period + 1,
            self.rsi_period + 1,
        ]
        .into_iter()
        .max()
        .unwrap_or(1)
    }
}

/// Direction of an EMA crossover on the last bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crossover {
    Bullish,
    Bearish,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub prev_macd_histogram: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub prev_ema_fast: f64,
    pub prev_ema_slow: f64,
    pub sma: f64,
    pub atr: f64,
    pub last: Candle,
}

fn data_item(candle: &Candle, index: usize) -> Result<DataItem> {
    DataItem::builder()
        .open(candle.open)
        .high(candle.high)
        .low(candle.low)
        .close(candle.close)
        .volume(candle.volume)
        .build()
        .map_err(|_| SignalError::InvalidCandle { index })
}

impl IndicatorSnapshot {
    pub fn compute(candles: &[Candle], params: &IndicatorParams) -> Result<Self> {
        let needed = params.min_candles();
        if candles.len() < needed {
            return Err(SignalError::InsufficientData {
                needed,
                got: candles.len(),
            });
        }

        let mut rsi = RelativeStrengthIndex::new(params.rsi_period).map_err(SignalError::indicator)?;
        let mut macd = MovingAverageConvergenceDivergence::new(
            params.macd_fast,
            params.macd_slow,
            params.macd_signal,
        )
        .map_err(SignalError::indicator)?;
        let mut bb = BollingerBands::new(params.bb_period, params.bb_multiplier)
            .map_err(SignalError::indicator)?;
        let mut ema_fast = ExponentialMovingAverage::new(params.ema_fast).map_err(SignalError::indicator)?;
        let mut ema_slow = ExponentialMovingAverage::new(params.ema_slow).map_err(SignalError::indicator)?;
        let mut sma = SimpleMovingAverage::new(params.sma_period).map_err(SignalError::indicator)?;
        let mut atr = AverageTrueRange::new(params.atr_period).map_err(SignalError::indicator)?;

        let mut snapshot = IndicatorSnapshot {
            rsi: 0.0,
            macd: 0.0,
            macd_signal: 0.0,
            macd_histogram: 0.0,
            prev_macd_histogram: 0.0,
            bb_upper: 0.0,
            bb_middle: 0.0,
            bb_lower: 0.0,
            ema_fast: 0.0,
            ema_slow: 0.0,
            prev_ema_fast: 0.0,
            prev_ema_slow: 0.0,
            sma: 0.0,
            atr: 0.0,
            last: candles[candles.len() - 1],
        };

        for (index, candle) in candles.iter().enumerate() {
            if !candle.is_valid() {
                return Err(SignalError::InvalidCandle { index });
            }
            let item = data_item(candle, index)?;
            let close = candle.close;

            snapshot.prev_macd_histogram = snapshot.macd_histogram;
            snapshot.prev_ema_fast = snapshot.ema_fast;
            snapshot.prev_ema_slow = snapshot.ema_slow;

            snapshot.rsi = rsi.next(close);
            let m = macd.next(close);
            snapshot.macd = m.macd;
            snapshot.macd_signal = m.signal;
            snapshot.macd_histogram = m.histogram;
            let b = bb.next(close);
            snapshot.bb_upper = b.upper;
            snapshot.bb_middle = b.average;
            snapshot.bb_lower = b.lower;
            snapshot.ema_fast = ema_fast.next(close);
            snapshot.ema_slow = ema_slow.next(close);
            snapshot.sma = sma.next(close);
            snapshot.atr = atr.next(&item);
        }

        Ok(snapshot)
    }

    pub fn close(&self) -> f64 {
        self.last.close
    }

    pub fn crossover(&self) -> Option<Crossover> {
        if self.prev_ema_fast <= self.prev_ema_slow && self.ema_fast > self.ema_slow {
            Some(Crossover::Bullish)
        } else if self.prev_ema_fast >= self.prev_ema_slow && self.ema_fast < self.ema_slow {
            Some(Crossover::Bearish)
        } else {
            None
        }
    }

    /// Position of the close within the bands: 0 at the lower band, 1 at the
    /// upper. Outside the bands the value leaves [0, 1].
    pub fn band_position(&self) -> f64 {
        let width = self.bb_upper - self.bb_lower;
        if width <= 0.0 {
            return 0.5;
        }
        (self.close() - self.bb_lower) / width
    }

    /// ATR as a fraction of the close.
    pub fn atr_ratio(&self) -> f64 {
        if self.close() <= 0.0 {
            return 0.0;
        }
        self.atr / self.close()
    }

    pub fn below_lower_band(&self) -> bool {
        self.close() <= self.bb_lower
    }

    pub fn above_upper_band(&self) -> bool {
        self.close() >= self.bb_upper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::series;

    #[test]
    fn test_rejects_short_series() {
        let candles = series(&[100.0; 10]);
        let err = IndicatorSnapshot::compute(&candles, &IndicatorParams::default()).unwrap_err();
        assert_eq!(err, SignalError::InsufficientData { needed: 35, got: 10 });
    }

    #[test]
    fn test_rejects_invalid_candle() {
        let mut candles = series(&[100.0; 40]);
        candles[5].low = -1.0;
        let err = IndicatorSnapshot::compute(&candles, &IndicatorParams::default()).unwrap_err();
        assert_eq!(err, SignalError::InvalidCandle { index: 5 });
    }

    #[test]
    fn test_rising_series() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let snap = IndicatorSnapshot::compute(&series(&closes), &IndicatorParams::default()).unwrap();

        assert!(snap.rsi > 70.0);
        assert!(snap.ema_fast > snap.ema_slow);
        assert!(snap.macd > 0.0);
        assert!(snap.bb_upper > snap.bb_middle && snap.bb_middle > snap.bb_lower);
        assert!(snap.atr > 0.0);
        assert_eq!(snap.close(), 159.0);
        assert_eq!(snap.crossover(), None);
    }

    #[test]
    fn test_crossover_detection() {
        // Long decline then a sharp reversal pulls the fast EMA through the slow.
        let mut closes: Vec<f64> = (0..50).map(|i| 200.0 - i as f64).collect();
        let mut snap = None;
        for step in 1..30 {
            closes.push(151.0 + step as f64 * 4.0);
            let s = IndicatorSnapshot::compute(&series(&closes), &IndicatorParams::default()).unwrap();
            if s.crossover() == Some(Crossover::Bullish) {
                snap = Some(s);
                break;
            }
        }
        let snap = snap.expect("bullish crossover within the rebound");
        assert!(snap.prev_ema_fast <= snap.prev_ema_slow);
        assert!(snap.ema_fast > snap.ema_slow);
    }

    #[test]
    fn test_flat_series_band_position() {
        let snap = IndicatorSnapshot::compute(&series(&[50.0; 40]), &IndicatorParams::default()).unwrap();
        assert!((snap.band_position() - 0.5).abs() < 1e-9);
        assert!(snap.atr_ratio() > 0.0);
    }
}
