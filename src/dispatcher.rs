//! Job submission: fan a job's items out over the worker pool and register
//! the single fan-in continuation that combines them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::{AggregateOutcome, Aggregator};
use crate::barrier::{Barrier, JoinOutcome};
use crate::error::{DispatchError, StoreError};
use crate::job::{Job, JobStatus, JobStatusRecord, Payload, TaskRecord};
use crate::store::{ResultStore, StatusStore, TASK_RESULT_PREFIX, job_status};
use crate::worker::{Task, WorkerPool};

/// What the fan-in of one job ended with.
#[derive(Debug)]
pub enum JobOutcome {
    Finished(AggregateOutcome),
    /// No task reported for a whole idle window. The job stays PROCESSING.
    Incomplete { arrived: usize, expected: usize },
    Cancelled,
}

struct JobHandle {
    cancel: CancellationToken,
    join: JoinHandle<JobOutcome>,
}

pub struct Dispatcher {
    pool: Arc<WorkerPool>,
    status: Arc<dyn StatusStore>,
    results: Arc<dyn ResultStore>,
    aggregator: Arc<Aggregator>,
    join_timeout: Duration,
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<WorkerPool>,
        status: Arc<dyn StatusStore>,
        results: Arc<dyn ResultStore>,
        aggregator: Arc<Aggregator>,
        join_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            status,
            results,
            aggregator,
            join_timeout,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Create a job for `rows` and start it. Returns as soon as every task is queued.
    pub fn submit_job(&self, rows: Vec<Payload>) -> Result<String, DispatchError> {
        let job = Job::new(rows.len());
        if rows.is_empty() {
            return Err(DispatchError::EmptyJob(job.id));
        }
        self.status
            .set(&job.id, JobStatusRecord::new(JobStatus::Queued, 0, job.total_items))?;
        tracing::info!(job_id = %job.id, total = job.total_items, created_at = %job.created_at, "Job queued");
        self.dispatch(&job, rows)?;
        Ok(job.id)
    }

    /// Fan out `rows` for an already created job.
    ///
    /// Either every task is queued or none is; on failure the job is marked
    /// CHORD_CREATION_FAILED.
    pub fn dispatch(&self, job: &Job, rows: Vec<Payload>) -> Result<(), DispatchError> {
        let total = job.total_items;
        self.status
            .set(&job.id, JobStatusRecord::new(JobStatus::Processing, 0, total))?;

        let barrier = Arc::new(Barrier::new(total));
        let cancel = CancellationToken::new();
        let tasks: Vec<Task> = job
            .items(rows)
            .into_iter()
            .map(|item| Task {
                task_id: Uuid::new_v4().to_string(),
                item,
                barrier: Arc::clone(&barrier),
                cancel: cancel.clone(),
            })
            .collect();

        if let Err(e) = self.pool.submit_group(tasks) {
            tracing::error!(job_id = %job.id, error = %e, "Task group submission failed");
            let failed = JobStatusRecord::new(JobStatus::ChordCreationFailed, 0, total);
            if let Err(store_err) = self.status.set(&job.id, failed) {
                tracing::error!(job_id = %job.id, error = %store_err, "Failed to record CHORD_CREATION_FAILED");
            }
            return Err(e);
        }

        let join = tokio::spawn(fan_in(
            job.id.clone(),
            total,
            barrier,
            Arc::clone(&self.aggregator),
            self.join_timeout,
            cancel.clone(),
        ));
        self.jobs.lock().insert(job.id.clone(), JobHandle { cancel, join });
        tracing::info!(job_id = %job.id, total, workers = self.pool.identities().len(), "Job dispatched");
        Ok(())
    }

    /// Wait for the job's fan-in to finish. `None` if the job is unknown to
    /// this dispatcher or was already waited on.
    pub async fn wait(&self, job_id: &str) -> Option<JobOutcome> {
        let handle = self.jobs.lock().remove(job_id)?;
        match handle.join.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Fan-in task failed");
                None
            }
        }
    }

    /// Stop outstanding tasks of the job and force its status to CANCELLED.
    /// Results already produced are kept.
    pub fn cancel(&self, job_id: &str) -> Result<(), DispatchError> {
        let Some(current) = job_status(self.status.as_ref(), job_id)? else {
            return Err(DispatchError::JobNotFound(job_id.to_string()));
        };
        if let Some(handle) = self.jobs.lock().get(job_id) {
            handle.cancel.cancel();
        }
        let (progress, total) = (current.progress, current.total);
        self.status
            .set(job_id, JobStatusRecord::new(JobStatus::Cancelled, progress, total))?;
        tracing::warn!(%job_id, progress, total, "Job cancelled");
        Ok(())
    }

    pub fn status(&self, job_id: &str) -> Result<Option<JobStatusRecord>, StoreError> {
        job_status(self.status.as_ref(), job_id)
    }

    /// Remove every durable trace of a job: status, progress and task results.
    pub fn purge(&self, job_id: &str) -> Result<usize, StoreError> {
        if let Some(handle) = self.jobs.lock().remove(job_id) {
            handle.cancel.cancel();
        }
        let mut removed = 0;
        for key in self.results.result_keys(TASK_RESULT_PREFIX)? {
            let Some(bytes) = self.results.get_result(&key)? else {
                continue;
            };
            let owned = serde_json::from_slice::<TaskRecord>(&bytes)
                .map(|record| record.job_id == job_id)
                .unwrap_or(false);
            if owned {
                self.results.delete_result(&key)?;
                removed += 1;
            }
        }
        self.status.delete_progress(job_id)?;
        self.status.delete_status(job_id)?;
        tracing::info!(%job_id, removed, "Job purged");
        Ok(removed)
    }
}

async fn fan_in(
    job_id: String,
    total: usize,
    barrier: Arc<Barrier>,
    aggregator: Arc<Aggregator>,
    join_timeout: Duration,
    cancel: CancellationToken,
) -> JobOutcome {
    let joined = barrier.join(join_timeout, |values| {
        let job_id = job_id.clone();
        async move {
            let combined = tokio::task::spawn_blocking(move || aggregator.combine(values, &job_id, total)).await;
            combined.unwrap_or_else(|e| AggregateOutcome::Failed {
                error: format!("combine task aborted: {e}"),
            })
        }
    });

    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!(%job_id, "Fan-in abandoned after cancellation");
            JobOutcome::Cancelled
        }
        outcome = joined => match outcome {
            JoinOutcome::Completed(combined) => JobOutcome::Finished(combined),
            JoinOutcome::TimedOut { arrived, expected } => {
                tracing::error!(%job_id, arrived, expected, "Job incomplete, left PROCESSING for recovery");
                JobOutcome::Incomplete { arrived, expected }
            }
            JoinOutcome::AlreadyJoined => {
                tracing::warn!(%job_id, "Barrier already joined");
                JobOutcome::Incomplete { arrived: barrier.arrived(), expected: barrier.expected() }
            }
        },
    }
}
