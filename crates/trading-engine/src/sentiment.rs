//! Sentiment adapter.
//!
//! Providers return a score in [-1, 1] per symbol (negative is bearish). The
//! engine only ever sees the cached, clamped value; a failing provider reads
//! as neutral.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use exchange_core::cache::TtlCache;
use tracing::warn;

#[async_trait]
pub trait SentimentProvider: Send + Sync {
    async fn sentiment(&self, symbol: &str) -> anyhow::Result<f64>;
}

/// Always neutral.
pub struct NeutralSentiment;

#[async_trait]
impl SentimentProvider for NeutralSentiment {
    async fn sentiment(&self, _symbol: &str) -> anyhow::Result<f64> {
        Ok(0.0)
    }
}

/// Fixed per-symbol scores, for paper runs and tests.
#[derive(Default)]
pub struct StaticSentiment {
    scores: DashMap<String, f64>,
}

impl StaticSentiment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, symbol: &str, score: f64) {
        self.scores.insert(symbol.to_string(), score);
    }
}

#[async_trait]
impl SentimentProvider for StaticSentiment {
    async fn sentiment(&self, symbol: &str) -> anyhow::Result<f64> {
        Ok(self.scores.get(symbol).map(|s| *s).unwrap_or(0.0))
    }
}

pub fn clamp_sentiment(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Caches a provider's answers for their own freshness window.
pub struct CachedSentiment {
    provider: Arc<dyn SentimentProvider>,
    cache: TtlCache<String, f64>,
}

impl CachedSentiment {
    pub fn new(provider: Arc<dyn SentimentProvider>, ttl: Duration, capacity: usize) -> Self {
        Self {
            provider,
            cache: TtlCache::new(ttl, capacity),
        }
    }

    pub async fn score(&self, symbol: &str) -> f64 {
        let result = self
            .cache
            .get_or_fetch(symbol.to_string(), || async {
                self.provider.sentiment(symbol).await.map(clamp_sentiment)
            })
            .await;
        match result {
            Ok(score) => score,
            Err(e) => {
                warn!(symbol, error = %e, "Sentiment unavailable, treating as neutral");
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        calls: AtomicU32,
        value: f64,
    }

    #[async_trait]
    impl SentimentProvider for Counting {
        async fn sentiment(&self, _symbol: &str) -> anyhow::Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value)
        }
    }

    struct Broken;

    #[async_trait]
    impl SentimentProvider for Broken {
        async fn sentiment(&self, _symbol: &str) -> anyhow::Result<f64> {
            anyhow::bail!("search quota exhausted")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_within_window() {
        let provider = Arc::new(Counting {
            calls: AtomicU32::new(0),
            value: 3.5,
        });
        let cached = CachedSentiment::new(provider.clone(), Duration::from_secs(900), 100);

        assert_eq!(cached.score("BTCUSDT").await, 1.0);
        assert_eq!(cached.score("BTCUSDT").await, 1.0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(901)).await;
        cached.score("BTCUSDT").await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_neutral() {
        let cached = CachedSentiment::new(Arc::new(Broken), Duration::from_secs(900), 100);
        assert_eq!(cached.score("ETHUSDT").await, 0.0);
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp_sentiment(f64::NAN), 0.0);
        assert_eq!(clamp_sentiment(-4.0), -1.0);
        assert_eq!(clamp_sentiment(0.25), 0.25);
    }
}
