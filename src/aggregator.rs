//! Fan-in side of a job: turns the barrier's collected values into the final
//! artifact and the terminal status.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::artifact::{Artifact, Table, TableWriter, default_writers, write_with_fallback};
use crate::error::{BatchError, StoreError};
use crate::generator::cell_text;
use crate::job::{ERROR_MARKER, ErrorKind, JobStatus, JobStatusRecord, Payload, ResultStatus, StepOutput, WorkerResult};
use crate::store::StatusStore;

const REQUIRED_FIELDS: [&str; 4] = ["index", "payload", "output", "status"];

/// Message carried by rows whose task never reported.
pub const LOST_TASK_MESSAGE: &str = "task produced no result";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombineReport {
    pub artifact: Artifact,
    pub status: JobStatus,
    pub succeeded: usize,
    pub errors: usize,
}

#[derive(Debug)]
pub enum AggregateOutcome {
    Combined(CombineReport),
    /// Both the normal pass and the salvage pass failed; the job is COMBINE_FAILURE.
    Failed { error: String },
}

pub struct Aggregator {
    status: Arc<dyn StatusStore>,
    data_dir: PathBuf,
    output_column: String,
    writers: Vec<Box<dyn TableWriter>>,
}

impl Aggregator {
    pub fn new(status: Arc<dyn StatusStore>, data_dir: impl Into<PathBuf>, output_column: impl Into<String>) -> Self {
        Self::with_writers(status, data_dir, output_column, default_writers())
    }

    pub fn with_writers(
        status: Arc<dyn StatusStore>,
        data_dir: impl Into<PathBuf>,
        output_column: impl Into<String>,
        writers: Vec<Box<dyn TableWriter>>,
    ) -> Self {
        Self {
            status,
            data_dir: data_dir.into(),
            output_column: output_column.into(),
            writers,
        }
    }

    /// File stem of the canonical artifact for `job_id`.
    pub fn artifact_stem(job_id: &str) -> String {
        format!("result_{job_id}")
    }

    /// Combine the values reported for a job into its artifact and terminal status.
    ///
    /// `results` is indexed by slot; `None` marks a task that never reported.
    /// Never panics on bad input: every entry becomes exactly one row.
    pub fn combine(&self, results: Vec<Option<Value>>, job_id: &str, total: usize) -> AggregateOutcome {
        tracing::info!(%job_id, reported = results.len(), total, "Combining results");

        let first_err = match self.try_combine(&results, job_id, total) {
            Ok(report) => return AggregateOutcome::Combined(report),
            Err(e) => e,
        };
        tracing::error!(%job_id, error = %first_err, "Combine failed, attempting salvage pass");

        let survivors: Vec<Option<Value>> = results
            .into_iter()
            .enumerate()
            .map(|(position, value)| value.and_then(|v| salvage_entry(v, position)))
            .collect();
        match self.try_combine(&survivors, job_id, total) {
            Ok(report) => {
                tracing::warn!(%job_id, status = %report.status, "Salvage pass succeeded");
                AggregateOutcome::Combined(report)
            }
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Salvage pass failed, marking job COMBINE_FAILURE");
                let record = JobStatusRecord::new(JobStatus::CombineFailure, 0, total);
                if let Err(store_err) = self.status.set(job_id, record) {
                    tracing::error!(%job_id, error = %store_err, "Failed to record COMBINE_FAILURE");
                }
                AggregateOutcome::Failed { error: e.to_string() }
            }
        }
    }

    fn try_combine(&self, results: &[Option<Value>], job_id: &str, total: usize) -> Result<CombineReport, BatchError> {
        let rows = order_rows(results, job_id, total);
        let succeeded = rows.iter().filter(|r| r.is_success()).count();
        let errors = rows.len() - succeeded;

        let table = Table::from_results(&rows, &self.output_column);
        let artifact = write_with_fallback(&self.data_dir, &Self::artifact_stem(job_id), &table, &self.writers)?;

        let status = JobStatus::from_counts(succeeded, errors, total);
        match self.status.set(job_id, JobStatusRecord::new(status, rows.len(), total)) {
            Ok(()) => {}
            Err(StoreError::TerminalStatus { current, .. }) => {
                tracing::warn!(%job_id, %current, computed = %status, "Job already terminal, keeping stored status");
            }
            Err(e) => return Err(e.into()),
        }
        self.status.delete_progress(job_id)?;

        tracing::info!(
            %job_id,
            %status,
            succeeded,
            errors,
            path = %artifact.path.display(),
            format = artifact.format,
            "Job combined",
        );
        Ok(CombineReport {
            artifact,
            status,
            succeeded,
            errors,
        })
    }
}

/// Normalize, de-duplicate and order the reported values. Every index in
/// `[0, total)` yields exactly one row.
pub(crate) fn order_rows(results: &[Option<Value>], job_id: &str, total: usize) -> Vec<WorkerResult> {
    let mut by_index: BTreeMap<usize, WorkerResult> = BTreeMap::new();
    for (position, entry) in results.iter().enumerate() {
        let result = normalize(entry.as_ref(), position, job_id);
        if result.index >= total {
            tracing::warn!(%job_id, index = result.index, total, "Dropping result with out-of-range index");
            continue;
        }
        keep_best(&mut by_index, result);
    }
    fill_gaps(by_index, job_id, total)
}

/// Keep the first success for an index, else the first entry.
pub(crate) fn keep_best(by_index: &mut BTreeMap<usize, WorkerResult>, result: WorkerResult) {
    match by_index.get(&result.index) {
        Some(existing) if existing.is_success() || !result.is_success() => {
            tracing::debug!(index = result.index, "Ignoring duplicate result");
        }
        _ => {
            by_index.insert(result.index, result);
        }
    }
}

pub(crate) fn fill_gaps(mut by_index: BTreeMap<usize, WorkerResult>, job_id: &str, total: usize) -> Vec<WorkerResult> {
    (0..total)
        .map(|index| {
            by_index.remove(&index).unwrap_or_else(|| {
                tracing::warn!(%job_id, index, "No result for index, using placeholder");
                WorkerResult::placeholder(index, job_id, ErrorKind::TaskLost, LOST_TASK_MESSAGE)
            })
        })
        .collect()
}

/// Turn one reported value into a well-formed result.
fn normalize(entry: Option<&Value>, position: usize, job_id: &str) -> WorkerResult {
    match entry {
        None | Some(Value::Null) => WorkerResult::placeholder(position, job_id, ErrorKind::TaskLost, LOST_TASK_MESSAGE),
        Some(Value::Object(map)) => repair(map, position, job_id),
        Some(other) => {
            tracing::warn!(%job_id, position, kind = value_kind(other), "Result is not a record");
            WorkerResult::placeholder(
                position,
                job_id,
                ErrorKind::Malformed,
                &format!("malformed result: expected a record, got {}", value_kind(other)),
            )
        }
    }
}

/// Patch a record with missing or mistyped fields. A record missing any
/// required field becomes an error row naming the missing fields.
fn repair(map: &Map<String, Value>, position: usize, job_id: &str) -> WorkerResult {
    let mut missing: Vec<&str> = Vec::new();

    let index = match map.get("index").and_then(Value::as_u64) {
        Some(i) => i as usize,
        None => {
            missing.push("index");
            position
        }
    };

    let payload = match map.get("payload") {
        Some(Value::Object(p)) => p.clone(),
        None | Some(Value::Null) => {
            missing.push("payload");
            Payload::new()
        }
        Some(other) => {
            let mut wrapped = Payload::new();
            wrapped.insert("original_data".into(), Value::String(cell_text(other)));
            wrapped
        }
    };

    let output = match map.get("output") {
        Some(Value::String(s)) => Some(s.clone()),
        None | Some(Value::Null) => {
            missing.push("output");
            None
        }
        Some(other) => Some(cell_text(other)),
    };

    let status = match map.get("status").and_then(Value::as_str) {
        Some("success") => Some(ResultStatus::Success),
        Some("error") => Some(ResultStatus::Error),
        _ => {
            missing.push("status");
            None
        }
    };

    let model_used = map
        .get("model_used")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let retry_count = map
        .get("retry_count")
        .and_then(Value::as_u64)
        .map(|n| n.min(u64::from(u32::MAX)) as u32);
    let error_kind = map
        .get("error_kind")
        .and_then(|k| serde_json::from_value::<ErrorKind>(k.clone()).ok());
    let outputs = map
        .get("outputs")
        .and_then(|o| serde_json::from_value::<Vec<StepOutput>>(o.clone()).ok())
        .unwrap_or_default();
    let job_id = map
        .get("job_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(job_id)
        .to_string();

    let base = WorkerResult {
        index,
        job_id,
        payload,
        output: String::new(),
        status: ResultStatus::Error,
        model_used,
        error_kind,
        retry_count,
        outputs,
    };

    match (output, status) {
        (Some(output), Some(status)) if missing.is_empty() => WorkerResult { output, status, ..base },
        _ => {
            tracing::warn!(index, ?missing, "Repairing result with missing fields");
            WorkerResult {
                output: format!("{ERROR_MARKER}: missing field {}", missing.join(", ")),
                error_kind: Some(ErrorKind::MissingField),
                ..base
            }
        }
    }
}

/// Keep only record-shaped entries for the salvage pass, pinning their
/// position as the index when the record has none.
fn salvage_entry(value: Value, position: usize) -> Option<Value> {
    let Value::Object(mut map) = value else {
        return None;
    };
    if !map.get("index").is_some_and(Value::is_u64) {
        map.insert("index".into(), Value::from(position));
    }
    if !map.get("payload").is_some_and(Value::is_object) {
        map.insert("payload".into(), Value::Object(Map::new()));
    }
    Some(Value::Object(map))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
