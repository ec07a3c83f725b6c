//! Fan-in barrier for one fan-out group.
//!
//! A [`Barrier`] knows how many tasks were fanned out. Each task reports once
//! into its own slot; when the last slot fills, the single registered
//! continuation runs with every slot's value in slot order. The join timeout
//! is an idle window: it restarts on every report, and a barrier that stays
//! silent for a whole window becomes an explicit [`JoinOutcome::TimedOut`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

/// What the join produced.
#[derive(Debug)]
pub enum JoinOutcome<T> {
    /// Every task reported; the continuation ran and returned `T`.
    Completed(T),
    /// No task reported for a whole idle window. The continuation did not run.
    TimedOut { arrived: usize, expected: usize },
    /// Another caller already joined this barrier.
    AlreadyJoined,
}

#[derive(Debug)]
struct Slots {
    values: Vec<Option<Value>>,
    reported: Vec<bool>,
    remaining: usize,
}

#[derive(Debug)]
pub struct Barrier {
    expected: usize,
    slots: Mutex<Slots>,
    progressed: Notify,
    joined: AtomicBool,
}

impl Barrier {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            slots: Mutex::new(Slots {
                values: vec![None; expected],
                reported: vec![false; expected],
                remaining: expected,
            }),
            progressed: Notify::new(),
            joined: AtomicBool::new(false),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn arrived(&self) -> usize {
        self.expected - self.slots.lock().remaining
    }

    /// Report the value for `slot`. `None` marks a task that finished without a
    /// usable result. Returns `false` if the slot is out of range or already
    /// reported; such reports are ignored.
    pub fn arrive(&self, slot: usize, value: Option<Value>) -> bool {
        let mut slots = self.slots.lock();
        if slot >= self.expected || slots.reported[slot] {
            tracing::warn!(slot, expected = self.expected, "Ignoring duplicate or out-of-range arrival");
            return false;
        }
        slots.reported[slot] = true;
        slots.values[slot] = value;
        slots.remaining -= 1;
        self.progressed.notify_one();
        true
    }

    /// Wait for every slot, then run `continuation` with the collected values.
    ///
    /// Gives up once `idle_timeout` passes without any report. The continuation
    /// runs at most once per barrier no matter how many callers join.
    pub async fn join<T, F, Fut>(&self, idle_timeout: Duration, continuation: F) -> JoinOutcome<T>
    where
        F: FnOnce(Vec<Option<Value>>) -> Fut,
        Fut: Future<Output = T>,
    {
        if self.joined.swap(true, Ordering::SeqCst) {
            return JoinOutcome::AlreadyJoined;
        }

        while self.slots.lock().remaining > 0 {
            if tokio::time::timeout(idle_timeout, self.progressed.notified()).await.is_err() {
                let arrived = self.arrived();
                tracing::warn!(
                    arrived,
                    expected = self.expected,
                    idle_secs = idle_timeout.as_secs(),
                    "Barrier join timed out with no report in the idle window",
                );
                return JoinOutcome::TimedOut {
                    arrived,
                    expected: self.expected,
                };
            }
        }

        let values = std::mem::take(&mut self.slots.lock().values);
        JoinOutcome::Completed(continuation(values).await)
    }
}
