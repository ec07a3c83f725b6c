//! Rebuilds a best-effort artifact from persisted per-task results when the
//! barrier continuation never ran or failed.
//!
//! Recovery reads only durable evidence: the progress counter and the
//! `task-result-*` records. It never touches the job's status.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::aggregator::keep_best;
use crate::artifact::{Artifact, Table, TableWriter, default_writers, write_with_fallback};
use crate::error::RecoveryError;
use crate::job::{TaskRecord, WorkerResult};
use crate::store::{ResultStore, StatusStore, TASK_RESULT_PREFIX};

/// One way persisted bytes may be laid out.
pub trait ResultDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decode and structurally validate. Returns the owning job id when the
    /// encoding carries one.
    fn decode(&self, bytes: &[u8]) -> Option<(Option<String>, WorkerResult)>;
}

/// `{task_id, job_id, state, result, date_done}` envelopes.
pub struct EnvelopeDecoder;

impl ResultDecoder for EnvelopeDecoder {
    fn name(&self) -> &'static str {
        "envelope"
    }

    fn decode(&self, bytes: &[u8]) -> Option<(Option<String>, WorkerResult)> {
        let record: TaskRecord = serde_json::from_slice(bytes).ok()?;
        Some((Some(record.job_id), record.result))
    }
}

/// A bare result record with at least `index`, `payload`, `output` and `status`.
pub struct BareDecoder;

impl ResultDecoder for BareDecoder {
    fn name(&self) -> &'static str {
        "bare"
    }

    fn decode(&self, bytes: &[u8]) -> Option<(Option<String>, WorkerResult)> {
        let result: WorkerResult = serde_json::from_slice(bytes).ok()?;
        let job_id = Some(result.job_id.clone()).filter(|id| !id.is_empty());
        Some((job_id, result))
    }
}

pub fn default_decoders() -> Vec<Box<dyn ResultDecoder>> {
    vec![Box::new(EnvelopeDecoder), Box::new(BareDecoder)]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub artifact: Artifact,
    pub succeeded: usize,
    pub errors: usize,
    /// Items known to exist (from the status record) with no persisted result.
    pub missing: Option<usize>,
}

#[derive(Debug)]
pub enum RecoveryOutcome {
    Recovered(RecoveryReport),
    NotRecoverable(String),
}

pub struct RecoveryEngine {
    status: Arc<dyn StatusStore>,
    results: Arc<dyn ResultStore>,
    data_dir: PathBuf,
    output_column: String,
    writers: Vec<Box<dyn TableWriter>>,
    decoders: Vec<Box<dyn ResultDecoder>>,
}

impl RecoveryEngine {
    pub fn new(
        status: Arc<dyn StatusStore>,
        results: Arc<dyn ResultStore>,
        data_dir: impl Into<PathBuf>,
        output_column: impl Into<String>,
    ) -> Self {
        Self {
            status,
            results,
            data_dir: data_dir.into(),
            output_column: output_column.into(),
            writers: default_writers(),
            decoders: default_decoders(),
        }
    }

    pub fn with_decoders(mut self, decoders: Vec<Box<dyn ResultDecoder>>) -> Self {
        self.decoders = decoders;
        self
    }

    pub fn with_writers(mut self, writers: Vec<Box<dyn TableWriter>>) -> Self {
        self.writers = writers;
        self
    }

    pub fn recover(&self, job_id: &str) -> Result<RecoveryOutcome, RecoveryError> {
        match self.status.progress(job_id)? {
            Some(n) if n > 0 => tracing::info!(%job_id, progress = n, "Recovering job"),
            _ => {
                tracing::info!(%job_id, "No progress recorded, nothing to recover");
                return Ok(RecoveryOutcome::NotRecoverable(format!(
                    "job {job_id} has no recorded progress"
                )));
            }
        }

        let mut by_index: BTreeMap<usize, WorkerResult> = BTreeMap::new();
        let mut undecodable = 0usize;
        for key in self.results.result_keys(TASK_RESULT_PREFIX)? {
            let Some(bytes) = self.results.get_result(&key)? else {
                continue;
            };
            match self.decode(&bytes) {
                Some((owner, result)) => {
                    let owner = owner.unwrap_or_else(|| result.job_id.clone());
                    if owner == job_id {
                        keep_best(&mut by_index, result);
                    }
                }
                None => {
                    undecodable += 1;
                    tracing::debug!(%key, "No decoder accepted persisted result");
                }
            }
        }

        if by_index.is_empty() {
            tracing::warn!(%job_id, undecodable, "No persisted results found for job");
            return Ok(RecoveryOutcome::NotRecoverable(format!(
                "no persisted results found for job {job_id}"
            )));
        }

        let rows: Vec<WorkerResult> = by_index.into_values().collect();
        let succeeded = rows.iter().filter(|r| r.is_success()).count();
        let errors = rows.len() - succeeded;
        let missing = self
            .status
            .get(job_id)?
            .map(|record| record.total.saturating_sub(rows.len()));

        let table = Table::from_results(&rows, &self.output_column);
        let stem = format!("RECOVERED_{job_id}_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let artifact = write_with_fallback(&self.data_dir, &stem, &table, &self.writers)?;

        tracing::info!(
            %job_id,
            recovered = rows.len(),
            succeeded,
            errors,
            ?missing,
            undecodable,
            path = %artifact.path.display(),
            "Recovered artifact written",
        );
        Ok(RecoveryOutcome::Recovered(RecoveryReport {
            artifact,
            succeeded,
            errors,
            missing,
        }))
    }

    fn decode(&self, bytes: &[u8]) -> Option<(Option<String>, WorkerResult)> {
        self.decoders.iter().find_map(|decoder| {
            let decoded = decoder.decode(bytes);
            if decoded.is_some() {
                tracing::trace!(decoder = decoder.name(), "Decoded persisted result");
            }
            decoded
        })
    }
}
