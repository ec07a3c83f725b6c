use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::WorkerResult;

pub const DONE_STATE: &str = "SUCCESS";

fn done_state() -> String {
    DONE_STATE.to_string()
}

/// Envelope persisted for every finished task under `task-result-<task_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub job_id: String,
    /// Always `SUCCESS`: the task itself finished; the row's own outcome is in `result.status`.
    #[serde(default = "done_state")]
    pub state: String,
    pub result: WorkerResult,
    pub date_done: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task_id: &str, result: WorkerResult) -> Self {
        Self {
            task_id: task_id.to_string(),
            job_id: result.job_id.clone(),
            state: done_state(),
            result,
            date_done: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
