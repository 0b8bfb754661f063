//! Live price stream.
//!
//! The all-market ticker stream feeds a process-wide [`PriceBook`]. The
//! lifecycle monitor prefers these prices and falls back to the exchange mark
//! price once an entry goes stale.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::types::PriceTick;
use crate::{Error, Result};

const TICKER_STREAM: &str = "!ticker@arr";
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Latest streamed price per symbol.
pub struct PriceBook {
    prices: DashMap<String, (Decimal, Instant)>,
    staleness: Duration,
}

impl PriceBook {
    pub fn new(staleness: Duration) -> Self {
        Self {
            prices: DashMap::new(),
            staleness,
        }
    }

    pub fn update(&self, symbol: &str, price: Decimal) {
        self.prices.insert(symbol.to_string(), (price, Instant::now()));
    }

    /// The streamed price if it is fresher than the staleness window.
    pub fn fresh_price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).and_then(|entry| {
            let (price, at) = *entry;
            (at.elapsed() < self.staleness).then_some(price)
        })
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Drain a ticker channel into the book until the sender goes away.
    pub fn spawn_feed(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<PriceTick>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                for tick in batch {
                    self.update(&tick.symbol, tick.price);
                }
            }
            info!("Ticker feed ended");
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "E")]
    event_time: i64,
}

fn parse_ticker_batch(text: &str) -> Vec<PriceTick> {
    let raw: Vec<RawTicker> = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "Ignoring non-ticker message");
            return Vec::new();
        }
    };
    raw.into_iter()
        .filter_map(|t| {
            let price = Decimal::from_str(&t.last_price).ok().filter(|p| *p > Decimal::ZERO)?;
            let timestamp = Utc.timestamp_millis_opt(t.event_time).single()?;
            Some(PriceTick {
                symbol: t.symbol,
                price,
                timestamp,
            })
        })
        .collect()
}

/// Subscribe to the all-market ticker stream.
///
/// Returns a receiver of price batches. The connection reconnects with
/// exponential backoff until the receiver is dropped.
pub fn subscribe_tickers(ws_url: &str) -> mpsc::Receiver<Vec<PriceTick>> {
    let (tx, rx) = mpsc::channel(1000);
    let url = format!("{}/{}", ws_url.trim_end_matches('/'), TICKER_STREAM);

    tokio::spawn(async move {
        ws_loop_with_reconnect(url, tx).await;
    });

    rx
}

async fn ws_loop_with_reconnect(url: String, tx: mpsc::Sender<Vec<PriceTick>>) {
    let mut attempt = 0u32;
    let max_backoff_secs = 60u64;
    let base_delay_secs = 1u64;

    loop {
        match ws_loop(&url, &tx).await {
            Ok(()) => {
                info!("Ticker stream closed cleanly");
                attempt = 0;
            }
            Err(e) => {
                warn!(attempt = attempt + 1, error = %e, "Ticker stream failed");
            }
        }

        if tx.is_closed() {
            info!("Ticker receiver dropped, stopping reconnection");
            return;
        }

        // 1s, 2s, 4s, ... capped
        let delay_secs = std::cmp::min(
            base_delay_secs.saturating_mul(2u64.saturating_pow(attempt)),
            max_backoff_secs,
        );
        warn!(delay_secs, attempt = attempt + 1, "Reconnecting ticker stream");
        tokio::time::sleep(Duration::from_secs(delay_secs)).await;

        attempt = attempt.saturating_add(1);
    }
}

async fn ws_loop(url: &str, tx: &mpsc::Sender<Vec<PriceTick>>) -> Result<()> {
    let (ws_stream, _) = connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();
    info!("Connected to ticker stream");

    let read_deadline = tokio::time::sleep(READ_TIMEOUT);
    tokio::pin!(read_deadline);

    loop {
        tokio::select! {
            _ = &mut read_deadline => {
                return Err(Error::Api {
                    message: format!("ticker stream silent for {}s", READ_TIMEOUT.as_secs()),
                    status: None,
                });
            }
            msg = read.next() => {
                read_deadline.as_mut().reset(Instant::now() + READ_TIMEOUT);

                let Some(msg) = msg else {
                    warn!("Ticker stream ended");
                    return Ok(());
                };

                match msg? {
                    Message::Text(text) => {
                        let batch = parse_ticker_batch(&text);
                        if batch.is_empty() {
                            continue;
                        }
                        if tx.send(batch).await.is_err() {
                            return Ok(());
                        }
                    }
                    Message::Ping(data) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Message::Close(_) => {
                        info!("Ticker stream closed by server");
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ticker_batch() {
        let text = r#"[
            {"e":"24hrTicker","E":1700000000000,"s":"BTCUSDT","c":"64000.10"},
            {"e":"24hrTicker","E":1700000000000,"s":"BADUSDT","c":"oops"},
            {"e":"24hrTicker","E":1700000000000,"s":"ETHUSDT","c":"3000.5"}
        ]"#;
        let batch = parse_ticker_batch(text);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].symbol, "BTCUSDT");
        assert_eq!(batch[1].price, Decimal::new(30005, 1));

        assert!(parse_ticker_batch(r#"{"result":null,"id":1}"#).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_goes_stale() {
        let book = PriceBook::new(Duration::from_secs(10));
        book.update("BTCUSDT", Decimal::from(64000));
        assert_eq!(book.fresh_price("BTCUSDT"), Some(Decimal::from(64000)));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(book.fresh_price("BTCUSDT"), None);
        assert_eq!(book.len(), 1);
    }

    #[tokio::test]
    async fn test_feed_drains_channel() {
        let book = Arc::new(PriceBook::new(Duration::from_secs(10)));
        let (tx, rx) = mpsc::channel(4);
        let handle = book.clone().spawn_feed(rx);

        tx.send(vec![PriceTick {
            symbol: "SOLUSDT".to_string(),
            price: Decimal::from(150),
            timestamp: Utc::now(),
        }])
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(book.fresh_price("SOLUSDT"), Some(Decimal::from(150)));
    }
}
