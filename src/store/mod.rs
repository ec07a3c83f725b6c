//! Durable job state shared by the dispatcher, the workers and status readers.
//!
//! [`StatusStore`] holds the per-job status record and progress counter;
//! [`ResultStore`] holds one persisted record per finished task, addressed by
//! `task-result-<task_id>`. Both must be safe to call from many workers at once.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::job::{JobStatus, JobStatusRecord};

/// Key prefix for persisted per-task results.
pub const TASK_RESULT_PREFIX: &str = "task-result-";

pub fn task_result_key(task_id: &str) -> String {
    format!("{TASK_RESULT_PREFIX}{task_id}")
}

pub trait StatusStore: Send + Sync {
    fn get(&self, job_id: &str) -> Result<Option<JobStatusRecord>, StoreError>;

    /// Write a status record, refusing to move a terminal job anywhere but `Cancelled`.
    fn set(&self, job_id: &str, record: JobStatusRecord) -> Result<(), StoreError>;

    /// Atomically add one to the job's progress counter and return the new value.
    fn increment_progress(&self, job_id: &str) -> Result<u64, StoreError>;

    fn progress(&self, job_id: &str) -> Result<Option<u64>, StoreError>;

    fn delete_progress(&self, job_id: &str) -> Result<(), StoreError>;

    fn delete_status(&self, job_id: &str) -> Result<(), StoreError>;
}

pub trait ResultStore: Send + Sync {
    fn put_result(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn get_result(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// All keys starting with `prefix`, sorted.
    fn result_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    fn delete_result(&self, key: &str) -> Result<(), StoreError>;
}

/// Status as a reader should see it: the stored record, with the live progress
/// counter merged in while the job is still processing.
pub fn job_status(
    store: &dyn StatusStore,
    job_id: &str,
) -> Result<Option<JobStatusRecord>, StoreError> {
    let Some(mut record) = store.get(job_id)? else {
        return Ok(None);
    };
    if record.status == JobStatus::Processing {
        if let Some(live) = store.progress(job_id)? {
            record.progress = (live as usize).min(record.total);
        }
    }
    Ok(Some(record))
}

pub(crate) fn check_transition(
    job_id: &str,
    current: Option<&JobStatusRecord>,
    next: &JobStatusRecord,
) -> Result<(), StoreError> {
    match current {
        Some(cur) if !cur.status.can_transition_to(&next.status) => Err(StoreError::TerminalStatus {
            job_id: job_id.to_string(),
            current: cur.status.to_string(),
            requested: next.status.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Keys become file names, so only a conservative character set is allowed.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !key.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}
