//! Cancellable per-user tasks.
//!
//! Each (user, purpose) pair owns at most one task. Scheduling a pair that is
//! already running replaces it; cancelling aborts the task immediately.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Scan,
    Monitor,
    Report,
    /// One-shot scan after an insufficient-funds skip.
    FundsRecheck,
}

#[derive(Default)]
pub struct Scheduler {
    tasks: DashMap<(String, TaskKind), JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` now and then every `period`. Overlapping runs are skipped,
    /// not queued.
    pub fn spawn_recurring<F, Fut>(&self, user_id: &str, kind: TaskKind, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                job().await;
            }
        });
        self.replace(user_id, kind, handle);
        debug!(user_id, ?kind, period_secs = period.as_secs(), "Scheduled recurring task");
    }

    /// Run `job` once after `delay`.
    pub fn spawn_once<Fut>(&self, user_id: &str, kind: TaskKind, delay: Duration, job: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            job.await;
        });
        self.replace(user_id, kind, handle);
    }

    fn replace(&self, user_id: &str, kind: TaskKind, handle: JoinHandle<()>) {
        if let Some(old) = self.tasks.insert((user_id.to_string(), kind), handle) {
            old.abort();
        }
    }

    pub fn is_scheduled(&self, user_id: &str, kind: TaskKind) -> bool {
        self.tasks
            .get(&(user_id.to_string(), kind))
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn cancel(&self, user_id: &str, kind: TaskKind) {
        if let Some((_, handle)) = self.tasks.remove(&(user_id.to_string(), kind)) {
            handle.abort();
        }
    }

    /// Abort every task the user owns. Returns how many were running.
    pub fn cancel_user(&self, user_id: &str) -> usize {
        let keys: Vec<(String, TaskKind)> = self
            .tasks
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| e.key().clone())
            .collect();
        let mut cancelled = 0;
        for key in keys {
            if let Some((_, handle)) = self.tasks.remove(&key) {
                if !handle.is_finished() {
                    cancelled += 1;
                }
                handle.abort();
            }
        }
        info!(user_id, cancelled, "Cancelled user tasks");
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_recurring_runs_until_cancelled() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        scheduler.spawn_recurring("alice", TaskKind::Monitor, Duration::from_secs(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // First tick fires immediately, then every 5s.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        assert_eq!(scheduler.cancel_user("alice"), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_scheduled("alice", TaskKind::Monitor));
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_and_replace() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        scheduler.spawn_once("bob", TaskKind::FundsRecheck, Duration::from_secs(300), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        // Rescheduling replaces the pending run rather than adding one.
        let counter = runs.clone();
        scheduler.spawn_once("bob", TaskKind::FundsRecheck, Duration::from_secs(300), async move {
            counter.fetch_add(10, Ordering::SeqCst);
        });
        assert!(scheduler.is_scheduled("bob", TaskKind::FundsRecheck));

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 10);
        assert!(!scheduler.is_scheduled("bob", TaskKind::FundsRecheck));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_other_user_untouched() {
        let scheduler = Scheduler::new();
        scheduler.spawn_once("alice", TaskKind::Report, Duration::from_secs(60), async {});
        scheduler.spawn_once("bob", TaskKind::Report, Duration::from_secs(60), async {});
        scheduler.cancel("alice", TaskKind::Report);
        assert!(!scheduler.is_scheduled("alice", TaskKind::Report));
        assert!(scheduler.is_scheduled("bob", TaskKind::Report));
    }
}
