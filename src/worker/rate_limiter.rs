use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, sleep};

/// Per-worker call spacing.
///
/// Each worker identity gets its own schedule: consecutive `acquire` calls for
/// the same identity are spaced at least `interval` apart, while different
/// identities never wait on each other. The lock is only held to reserve a
/// slot, never across the sleep.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until `worker` may make its next call.
    pub async fn acquire(&self, worker: &str) {
        let wait = {
            let mut slots = self.next_slot.lock();
            let now = Instant::now();
            let slot = slots
                .get(worker)
                .copied()
                .filter(|slot| *slot > now)
                .unwrap_or(now);
            slots.insert(worker.to_string(), slot + self.interval);
            slot - now
        };
        if !wait.is_zero() {
            tracing::trace!(worker, wait_ms = wait.as_millis() as u64, "Rate limiter delaying call");
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn same_worker_calls_are_spaced() {
        let limiter = RateLimiter::new(Duration::from_millis(200));
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire("worker-1").await;
        }
        assert!(start.elapsed() >= Duration::from_millis(800));
        assert!(start.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_for_one_worker_still_serialize() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(100)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire("w").await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_workers_do_not_wait_on_each_other() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(1)));
        let start = Instant::now();
        let a = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire("worker-1").await })
        };
        let b = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire("worker-2").await })
        };
        a.await.unwrap();
        b.await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_worker_is_not_delayed() {
        let limiter = RateLimiter::new(Duration::from_millis(200));
        limiter.acquire("w").await;
        sleep(Duration::from_millis(500)).await;
        let start = Instant::now();
        limiter.acquire("w").await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
