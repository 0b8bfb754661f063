//! Per-(user, symbol) in-flight guard.
//!
//! The lifecycle monitor and the allocator both mutate a symbol's position;
//! whoever holds the guard goes first and the other skips this round.

use std::sync::Arc;

use dashmap::DashSet;

#[derive(Default, Clone)]
pub struct InFlight {
    keys: Arc<DashSet<(String, String)>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when another task already holds this key.
    pub fn try_acquire(&self, user_id: &str, symbol: &str) -> Option<InFlightGuard> {
        let key = (user_id.to_string(), symbol.to_string());
        if self.keys.insert(key.clone()) {
            Some(InFlightGuard {
                keys: self.keys.clone(),
                key,
            })
        } else {
            None
        }
    }

    pub fn is_busy(&self, user_id: &str, symbol: &str) -> bool {
        self.keys
            .contains(&(user_id.to_string(), symbol.to_string()))
    }
}

/// Releases its key on drop, including on early return and panic unwinding.
pub struct InFlightGuard {
    keys: Arc<DashSet<(String, String)>>,
    key: (String, String),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_per_key() {
        let in_flight = InFlight::new();
        let guard = in_flight.try_acquire("alice", "BTCUSDT").unwrap();
        assert!(in_flight.try_acquire("alice", "BTCUSDT").is_none());
        assert!(in_flight.try_acquire("alice", "ETHUSDT").is_some());
        assert!(in_flight.try_acquire("bob", "BTCUSDT").is_some());

        drop(guard);
        assert!(!in_flight.is_busy("alice", "BTCUSDT"));
        assert!(in_flight.try_acquire("alice", "BTCUSDT").is_some());
    }
}
