//! Wires the durable store, the worker pool, the dispatcher and the recovery
//! engine from a [`BatchConfig`].

use std::sync::Arc;

use crate::aggregator::Aggregator;
use crate::config::BatchConfig;
use crate::dispatcher::{Dispatcher, JobOutcome};
use crate::error::{BatchError, DispatchError};
use crate::generator::{AnthropicClient, ClientSettings, Generator};
use crate::job::{JobStatusRecord, Payload};
use crate::recovery::{RecoveryEngine, RecoveryOutcome};
use crate::store::{FileStore, job_status};
use crate::worker::{ModelAssigner, Processor, RateLimiter, WorkerContext, WorkerPool};

pub fn open_store(config: &BatchConfig) -> Result<Arc<FileStore>, BatchError> {
    Ok(Arc::new(FileStore::open(&config.data_dir)?))
}

pub fn recovery_engine(config: &BatchConfig, store: &Arc<FileStore>) -> RecoveryEngine {
    RecoveryEngine::new(store.clone(), store.clone(), &config.data_dir, &config.output_column)
}

pub fn http_generator(config: &BatchConfig) -> Result<AnthropicClient, BatchError> {
    if config.api_key.is_empty() {
        return Err(BatchError::Config(
            "no API key: set ANTHROPIC_API_KEY or api_key in batchforge.toml".into(),
        ));
    }
    let settings = ClientSettings {
        api_key: config.api_key.clone(),
        base_url: config.api_url.clone(),
        max_tokens: config.max_tokens,
        request_timeout: config.request_timeout(),
        max_retry_after: config.max_retry_after(),
    };
    Ok(AnthropicClient::new(settings)?)
}

/// A running batch system: store, pool and dispatcher sharing one data directory.
pub struct Engine {
    store: Arc<FileStore>,
    pool: Arc<WorkerPool>,
    dispatcher: Dispatcher,
    recovery: RecoveryEngine,
}

impl Engine {
    /// Open the store and start `worker_count` workers. Must run inside a tokio runtime.
    pub fn start<G: Generator>(config: &BatchConfig, generator: G) -> Result<Self, BatchError> {
        let store = open_store(config)?;
        let assigner = ModelAssigner::new(config.models.clone())?;
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_interval()));
        let contexts = WorkerContext::pool(config.worker_count, &assigner, &limiter);

        let processor = Arc::new(Processor::new(
            Arc::new(generator),
            store.clone(),
            store.clone(),
            config.retry(),
            config.request_timeout(),
        )
        .with_steps(config.steps()));
        let pool = Arc::new(WorkerPool::start(processor, contexts));
        let aggregator = Arc::new(Aggregator::new(store.clone(), &config.data_dir, &config.output_column));
        let dispatcher = Dispatcher::new(
            Arc::clone(&pool),
            store.clone(),
            store.clone(),
            aggregator,
            config.join_timeout(),
        );
        let recovery = recovery_engine(config, &store);

        tracing::info!(
            workers = config.worker_count,
            steps = config.steps().len(),
            data_dir = %config.data_dir.display(),
            max_retries = config.max_retries,
            "Engine started",
        );
        Ok(Self {
            store,
            pool,
            dispatcher,
            recovery,
        })
    }

    pub fn submit(&self, rows: Vec<Payload>) -> Result<String, BatchError> {
        Ok(self.dispatcher.submit_job(rows)?)
    }

    pub async fn wait(&self, job_id: &str) -> Option<JobOutcome> {
        self.dispatcher.wait(job_id).await
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatusRecord, BatchError> {
        job_status(self.store.as_ref(), job_id)?.ok_or_else(|| BatchError::JobNotFound(job_id.to_string()))
    }

    pub fn cancel(&self, job_id: &str) -> Result<(), BatchError> {
        match self.dispatcher.cancel(job_id) {
            Err(DispatchError::JobNotFound(id)) => Err(BatchError::JobNotFound(id)),
            other => Ok(other?),
        }
    }

    pub fn purge(&self, job_id: &str) -> Result<usize, BatchError> {
        Ok(self.dispatcher.purge(job_id)?)
    }

    pub fn recover(&self, job_id: &str) -> Result<RecoveryOutcome, BatchError> {
        Ok(self.recovery.recover(job_id)?)
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        tracing::info!("Engine stopped");
    }
}
