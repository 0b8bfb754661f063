//! Per-credential request budgeting.
//!
//! Each key gets a fixed window. Once the window's budget is spent, callers
//! wait until the window resets instead of failing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    budget: u32,
    window: Duration,
    windows: DashMap<String, Arc<Mutex<Window>>>,
}

impl RateLimiter {
    pub fn new(budget: u32, window: Duration) -> Self {
        Self {
            budget: budget.max(1),
            window,
            windows: DashMap::new(),
        }
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Window>> {
        self.windows
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Window {
                    started: Instant::now(),
                    count: 0,
                }))
            })
            .clone()
    }

    /// Take one call from `key`'s budget, waiting for the next window if it
    /// is exhausted.
    ///
    /// Callers on the same key queue behind the lock, so waiting callers are
    /// admitted in arrival order.
    pub async fn acquire(&self, key: &str) {
        let slot = self.slot(key);
        let mut window = slot.lock().await;

        let now = Instant::now();
        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.budget {
            let reset_at = window.started + self.window;
            debug!(
                budget = self.budget,
                wait_ms = reset_at.saturating_duration_since(now).as_millis() as u64,
                "Request budget exhausted, waiting for window reset"
            );
            tokio::time::sleep_until(reset_at).await;
            window.started = Instant::now();
            window.count = 0;
        }

        window.count += 1;
    }

    /// Calls left in the current window for `key`.
    pub async fn remaining(&self, key: &str) -> u32 {
        let slot = self.slot(key);
        let window = slot.lock().await;
        if window.started.elapsed() >= self.window {
            self.budget
        } else {
            self.budget.saturating_sub(window.count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test(start_paused = true)]
    async fn test_call_over_budget_waits_for_reset() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        limiter.acquire("key-a").await;
        limiter.acquire("key-a").await;
        assert_eq!(limiter.remaining("key-a").await, 0);

        let mut third = task::spawn(limiter.acquire("key-a"));
        assert_pending!(third.poll());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_pending!(third.poll());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(third.is_woken());
        assert_ready!(third.poll());
        drop(third);

        assert_eq!(limiter.remaining("key-a").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budgets_are_per_key() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.acquire("key-a").await;

        let mut other = task::spawn(limiter.acquire("key-b"));
        assert_ready!(other.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_elapsed() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.acquire("key-a").await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let mut next = task::spawn(limiter.acquire("key-a"));
        assert_ready!(next.poll());
    }
}
