use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use super::{ResultStore, StatusStore, check_transition};
use crate::error::StoreError;
use crate::job::JobStatusRecord;

/// In-process store. Not durable; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    statuses: Mutex<HashMap<String, JobStatusRecord>>,
    progress: Mutex<HashMap<String, u64>>,
    results: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl StatusStore for MemoryStore {
    fn get(&self, job_id: &str) -> Result<Option<JobStatusRecord>, StoreError> {
        Ok(self.statuses.lock().get(job_id).copied())
    }

    fn set(&self, job_id: &str, record: JobStatusRecord) -> Result<(), StoreError> {
        let mut statuses = self.statuses.lock();
        check_transition(job_id, statuses.get(job_id), &record)?;
        statuses.insert(job_id.to_string(), record);
        Ok(())
    }

    fn increment_progress(&self, job_id: &str) -> Result<u64, StoreError> {
        let mut progress = self.progress.lock();
        let counter = progress.entry(job_id.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    fn progress(&self, job_id: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.progress.lock().get(job_id).copied())
    }

    fn delete_progress(&self, job_id: &str) -> Result<(), StoreError> {
        self.progress.lock().remove(job_id);
        Ok(())
    }

    fn delete_status(&self, job_id: &str) -> Result<(), StoreError> {
        self.statuses.lock().remove(job_id);
        Ok(())
    }
}

impl ResultStore for MemoryStore {
    fn put_result(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.results.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get_result(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.results.lock().get(key).cloned())
    }

    fn result_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .results
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete_result(&self, key: &str) -> Result<(), StoreError> {
        self.results.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use std::sync::Arc;

    #[test]
    fn concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::default());
        std::thread::scope(|s| {
            for _ in 0..8 {
                let store = Arc::clone(&store);
                s.spawn(move || {
                    for _ in 0..100 {
                        store.increment_progress("j").unwrap();
                    }
                });
            }
        });
        assert_eq!(store.progress("j").unwrap(), Some(800));
    }

    #[test]
    fn terminal_status_is_sticky() {
        let store = MemoryStore::default();
        store
            .set("j", JobStatusRecord::new(JobStatus::Success, 1, 1))
            .unwrap();
        let err = store
            .set("j", JobStatusRecord::new(JobStatus::Processing, 0, 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalStatus { .. }));
        store
            .set("j", JobStatusRecord::new(JobStatus::Cancelled, 1, 1))
            .unwrap();
        assert_eq!(store.get("j").unwrap().unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn result_keys_filter_by_prefix() {
        let store = MemoryStore::default();
        store.put_result("task-result-b", b"{}").unwrap();
        store.put_result("task-result-a", b"{}").unwrap();
        store.put_result("other", b"{}").unwrap();
        assert_eq!(
            store.result_keys("task-result-").unwrap(),
            vec!["task-result-a".to_string(), "task-result-b".to_string()]
        );
    }
}
