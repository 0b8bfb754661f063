//! Outbound trading events.
//!
//! The engine never waits on delivery: events go out with `try_send` and a
//! full or closed channel drops the event with a warning.

use std::fmt;

use chrono::{DateTime, Utc};
use exchange_core::types::Side;
use market_signals::Anomaly;
use risk_manager::{ExitReason, PartialLevel};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::report::DailyReport;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TradingEvent {
    PositionOpened {
        user_id: String,
        symbol: String,
        side: Side,
        quantity: Decimal,
        leverage: u32,
        price: Decimal,
        score: f64,
    },
    PositionClosed {
        user_id: String,
        symbol: String,
        side: Side,
        reason: ExitReason,
        exit_price: Option<Decimal>,
        pnl: Option<Decimal>,
    },
    PartialTakeProfit {
        user_id: String,
        symbol: String,
        level: PartialLevel,
        quantity: Decimal,
        price: Decimal,
    },
    TrailingStopUpdated {
        user_id: String,
        symbol: String,
        stop_loss: Decimal,
        trailing_take_profit: Decimal,
    },
    StagnationClose {
        user_id: String,
        symbol: String,
        price: Decimal,
        minutes_open: i64,
    },
    HedgeOpened {
        user_id: String,
        symbol: String,
        side: Side,
        quantity: Decimal,
    },
    ReEntry {
        user_id: String,
        symbol: String,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    },
    AnomalyDetected {
        user_id: String,
        symbol: String,
        anomaly: Anomaly,
    },
    DailyReport {
        user_id: String,
        report: DailyReport,
    },
    InsufficientFunds {
        user_id: String,
        available: Decimal,
        total: Decimal,
        retry_at: DateTime<Utc>,
    },
    Failure {
        user_id: String,
        symbol: Option<String>,
        message: String,
    },
}

impl TradingEvent {
    pub fn user_id(&self) -> &str {
        match self {
            TradingEvent::PositionOpened { user_id, .. }
            | TradingEvent::PositionClosed { user_id, .. }
            | TradingEvent::PartialTakeProfit { user_id, .. }
            | TradingEvent::TrailingStopUpdated { user_id, .. }
            | TradingEvent::StagnationClose { user_id, .. }
            | TradingEvent::HedgeOpened { user_id, .. }
            | TradingEvent::ReEntry { user_id, .. }
            | TradingEvent::AnomalyDetected { user_id, .. }
            | TradingEvent::DailyReport { user_id, .. }
            | TradingEvent::InsufficientFunds { user_id, .. }
            | TradingEvent::Failure { user_id, .. } => user_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TradingEvent::PositionOpened { .. } => "position_opened",
            TradingEvent::PositionClosed { .. } => "position_closed",
            TradingEvent::PartialTakeProfit { .. } => "partial_take_profit",
            TradingEvent::TrailingStopUpdated { .. } => "trailing_stop_updated",
            TradingEvent::StagnationClose { .. } => "stagnation_close",
            TradingEvent::HedgeOpened { .. } => "hedge_opened",
            TradingEvent::ReEntry { .. } => "re_entry",
            TradingEvent::AnomalyDetected { .. } => "anomaly_detected",
            TradingEvent::DailyReport { .. } => "daily_report",
            TradingEvent::InsufficientFunds { .. } => "insufficient_funds",
            TradingEvent::Failure { .. } => "failure",
        }
    }
}

fn opt(value: &Option<Decimal>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for TradingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingEvent::PositionOpened {
                symbol,
                side,
                quantity,
                leverage,
                price,
                score,
                ..
            } => write!(
                f,
                "Opened {side} {symbol}: {quantity} @ {price} ({leverage}x, score {score:.2})"
            ),
            TradingEvent::PositionClosed {
                symbol,
                side,
                reason,
                exit_price,
                pnl,
                ..
            } => write!(
                f,
                "Closed {side} {symbol} on {reason} @ {} (PnL {})",
                opt(exit_price),
                opt(pnl)
            ),
            TradingEvent::PartialTakeProfit {
                symbol,
                level,
                quantity,
                price,
                ..
            } => write!(f, "Partial take-profit {level:?} on {symbol}: {quantity} @ {price}"),
            TradingEvent::TrailingStopUpdated {
                symbol, stop_loss, ..
            } => write!(f, "Trailing stop on {symbol} moved to {stop_loss}"),
            TradingEvent::StagnationClose {
                symbol,
                price,
                minutes_open,
                ..
            } => write!(
                f,
                "Closed stagnant {symbol} @ {price} after {minutes_open} minutes"
            ),
            TradingEvent::HedgeOpened {
                symbol,
                side,
                quantity,
                ..
            } => write!(f, "Hedged {symbol} with {side} {quantity}"),
            TradingEvent::ReEntry {
                symbol,
                side,
                quantity,
                price,
                ..
            } => write!(f, "Re-entered {side} {symbol}: {quantity} @ {price}"),
            TradingEvent::AnomalyDetected {
                symbol, anomaly, ..
            } => write!(f, "Skipping {symbol}: {anomaly}"),
            TradingEvent::DailyReport { report, .. } => write!(f, "{report}"),
            TradingEvent::InsufficientFunds {
                available,
                total,
                retry_at,
                ..
            } => write!(
                f,
                "Insufficient funds ({available} of {total} available), retrying at {}",
                retry_at.format("%H:%M UTC")
            ),
            TradingEvent::Failure {
                symbol, message, ..
            } => match symbol {
                Some(symbol) => write!(f, "{symbol}: {message}"),
                None => f.write_str(message),
            },
        }
    }
}

/// Non-blocking sender half of the event channel.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<TradingEvent>,
}

impl EventSink {
    pub fn emit(&self, event: TradingEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let event = match &e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
            };
            warn!(
                user_id = event.user_id(),
                kind = event.kind(),
                closed = matches!(e, mpsc::error::TrySendError::Closed(_)),
                "Dropped trading event"
            );
        }
    }
}

pub fn event_channel(capacity: usize) -> (EventSink, mpsc::Receiver<TradingEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(message: &str) -> TradingEvent {
        TradingEvent::Failure {
            user_id: "alice".to_string(),
            symbol: None,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (sink, mut rx) = event_channel(1);
        sink.emit(failure("first"));
        sink.emit(failure("second"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.to_string(), "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (sink, rx) = event_channel(4);
        drop(rx);
        sink.emit(failure("nobody listening"));
    }

    #[test]
    fn test_display() {
        let event = TradingEvent::PositionClosed {
            user_id: "alice".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            reason: ExitReason::StopLoss,
            exit_price: Some(Decimal::from(98)),
            pnl: None,
        };
        assert_eq!(event.to_string(), "Closed LONG BTCUSDT on stop-loss @ 98 (PnL -)");
        assert_eq!(event.kind(), "position_closed");
        assert_eq!(event.user_id(), "alice");
    }
}
