//! Worker side of the system: a fixed pool of long-lived workers, each with a
//! stable identity, a model pinned for its lifetime and a shared rate limiter.

mod model;
mod pool;
pub(crate) mod processor;
mod rate_limiter;

use std::sync::Arc;

pub use model::{DEFAULT_MODELS, ModelAssigner};
pub use pool::{Task, WorkerPool};
pub use processor::{Processor, RetryDecision, decide};
pub use rate_limiter::RateLimiter;

/// Per-worker state fixed at startup.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub identity: String,
    pub model: String,
    pub limiter: Arc<RateLimiter>,
}

impl WorkerContext {
    pub fn new(identity: String, assigner: &ModelAssigner, limiter: Arc<RateLimiter>) -> Self {
        let model = assigner.assign(&identity).to_string();
        Self {
            identity,
            model,
            limiter,
        }
    }

    /// Contexts for `worker-1` through `worker-<count>`.
    pub fn pool(count: usize, assigner: &ModelAssigner, limiter: &Arc<RateLimiter>) -> Vec<Self> {
        (1..=count)
            .map(|n| Self::new(format!("worker-{n}"), assigner, Arc::clone(limiter)))
            .collect()
    }
}
