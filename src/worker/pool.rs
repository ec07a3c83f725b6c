use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Processor, WorkerContext};
use crate::barrier::Barrier;
use crate::error::DispatchError;
use crate::generator::Generator;
use crate::job::WorkItem;

/// One unit of work queued on the pool.
pub struct Task {
    pub task_id: String,
    pub item: WorkItem,
    /// Barrier the result is reported to, in slot `item.index`.
    pub barrier: Arc<Barrier>,
    /// Cancelled when the owning job is cancelled.
    pub cancel: CancellationToken,
}

/// Fixed set of long-lived workers pulling from one shared queue.
pub struct WorkerPool {
    sender: Mutex<Option<UnboundedSender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    identities: Vec<String>,
}

impl WorkerPool {
    /// Spawn one worker per context. Must be called inside a tokio runtime.
    pub fn start<G: Generator>(processor: Arc<Processor<G>>, contexts: Vec<WorkerContext>) -> Self {
        let (tx, rx) = unbounded_channel::<Task>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let identities = contexts.iter().map(|c| c.identity.clone()).collect();

        let workers = contexts
            .into_iter()
            .map(|ctx| {
                tracing::info!(worker = %ctx.identity, model = %ctx.model, "Worker started");
                tokio::spawn(run_worker(Arc::clone(&processor), ctx, Arc::clone(&rx)))
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            identities,
        }
    }

    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    /// Queue every task of a group, or none of them.
    pub fn submit_group(&self, tasks: Vec<Task>) -> Result<(), DispatchError> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(DispatchError::PoolClosed);
        };
        // The receiver lives until every worker has exited, and workers only
        // exit after the sender is dropped, so these sends cannot fail halfway
        // while the lock is held.
        for task in tasks {
            tx.send(task)
                .map_err(|e| DispatchError::Registration(format!("queue rejected task {}", e.0.task_id)))?;
        }
        Ok(())
    }

    /// Stop accepting work, let the workers drain the queue, and wait for them.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker exited abnormally");
            }
        }
    }
}

async fn run_worker<G: Generator>(
    processor: Arc<Processor<G>>,
    ctx: WorkerContext,
    queue: Arc<tokio::sync::Mutex<UnboundedReceiver<Task>>>,
) {
    loop {
        let next = { queue.lock().await.recv().await };
        let Some(task) = next else {
            break;
        };
        let Task {
            task_id,
            item,
            barrier,
            cancel,
        } = task;

        if cancel.is_cancelled() {
            tracing::debug!(job_id = %item.job_id, index = item.index, "Skipping task of cancelled job");
            continue;
        }

        let index = item.index;
        let job_id = item.job_id.clone();
        let processor = Arc::clone(&processor);
        let worker = ctx.clone();
        let run = tokio::spawn(async move { processor.process(&worker, &item, &task_id, &cancel).await });

        match run.await {
            Ok(Some(result)) => {
                barrier.arrive(index, serde_json::to_value(&result).ok());
            }
            Ok(None) => {
                tracing::debug!(%job_id, index, "Task cancelled mid-flight");
            }
            Err(e) => {
                tracing::error!(%job_id, index, worker = %ctx.identity, error = %e, "Task crashed");
                barrier.arrive(index, None);
            }
        }
    }
    tracing::info!(worker = %ctx.identity, "Worker stopped");
}
