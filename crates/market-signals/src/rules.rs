//! Boolean entry rules.
//!
//! Each rule is an AND of independent conditions; the scorer only considers a
//! symbol once one of them fires.

use exchange_core::types::Side;
use serde::{Deserialize, Serialize};

use crate::flow::is_strong_volume;
use crate::SignalSet;

pub const RSI_OVERSOLD: f64 = 30.0;
pub const RSI_OVERBOUGHT: f64 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryRule {
    LongAtSupport,
    ShortAtResistance,
}

impl EntryRule {
    pub fn side(&self) -> Side {
        match self {
            EntryRule::LongAtSupport => Side::Long,
            EntryRule::ShortAtResistance => Side::Short,
        }
    }

    pub fn evaluate(signals: &SignalSet) -> Option<EntryRule> {
        let snap = &signals.snapshot;
        let strong = is_strong_volume(signals.volume_ratio);

        let long = snap.rsi <= RSI_OVERSOLD
            && snap.below_lower_band()
            && (strong || signals.support_bounce);
        if long {
            return Some(EntryRule::LongAtSupport);
        }

        let short = snap.rsi >= RSI_OVERBOUGHT
            && snap.above_upper_band()
            && (strong || signals.resistance_rejection);
        short.then_some(EntryRule::ShortAtResistance)
    }
}
