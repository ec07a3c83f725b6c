use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Field name to value mapping for one input row. Field order is preserved.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A submitted batch of rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub total_items: usize,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(total_items: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            total_items,
            created_at: Utc::now(),
        }
    }

    /// Turn an ordered list of rows into work items, using list position as index.
    pub fn items(&self, rows: Vec<Payload>) -> Vec<WorkItem> {
        rows.into_iter()
            .enumerate()
            .map(|(index, payload)| WorkItem {
                index,
                payload,
                job_id: self.id.clone(),
            })
            .collect()
    }
}

/// One row of a job. The index is the row's position in the submitted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub index: usize,
    pub payload: Payload,
    pub job_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStatus::Success => write!(f, "success"),
            ResultStatus::Error => write!(f, "error"),
        }
    }
}

/// Why a row ended in error. Persisted alongside the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Timeout,
    Connection,
    QuotaExhausted,
    Api,
    InvalidResponse,
    /// The result record lacked one or more required fields.
    MissingField,
    /// The result was not a record at all.
    Malformed,
    /// The task never reported a result (crashed, aborted or timed out at the barrier).
    TaskLost,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::Api => "api",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::MissingField => "missing_field",
            ErrorKind::Malformed => "malformed",
            ErrorKind::TaskLost => "task_lost",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Prefix carried in `output` by rows that failed for any reason other than quota.
pub const ERROR_MARKER: &str = "ERROR";
/// Prefix carried in `output` by rows that hit the daily quota.
pub const DAILY_LIMIT_MARKER: &str = "DAILY_LIMIT_HIT";
/// Prefix of a sequence step that never ran because an earlier step failed.
pub const SKIPPED_MARKER: &str = "SKIPPED";

/// One prompt applied to every row: the artifact column its text lands in and
/// the instruction sent ahead of the row's fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub column: String,
    #[serde(default)]
    pub instruction: String,
}

impl Step {
    pub fn new(column: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            instruction: instruction.into(),
        }
    }
}

/// Text one step produced for a row, or the marker standing in for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub column: String,
    pub text: String,
}

impl StepOutput {
    pub fn new(column: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            text: text.into(),
        }
    }

    /// Placeholder for a step after `failed_column` in the same sequence.
    pub fn skipped(column: impl Into<String>, failed_column: &str) -> Self {
        Self::new(column, format!("{SKIPPED_MARKER}: {failed_column} failed"))
    }
}

/// `ERROR: <message>`, or `DAILY_LIMIT_HIT: <message>` for quota exhaustion.
pub fn failure_text(kind: ErrorKind, message: &str) -> String {
    let marker = if kind == ErrorKind::QuotaExhausted {
        DAILY_LIMIT_MARKER
    } else {
        ERROR_MARKER
    };
    format!("{marker}: {message}")
}

/// The outcome of processing one [`WorkItem`].
///
/// Errors travel inside the record: `status` says whether the row succeeded and
/// `output` carries a marker string when it did not. Rows of a multi-step job
/// also list every step's text in `outputs`; `output` then mirrors the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub index: usize,
    #[serde(default)]
    pub job_id: String,
    pub payload: Payload,
    pub output: String,
    pub status: ResultStatus,
    #[serde(default = "unknown_model")]
    pub model_used: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<StepOutput>,
}

fn unknown_model() -> String {
    "unknown".to_string()
}

impl WorkerResult {
    pub fn success(item: &WorkItem, output: String, model: &str, retries: u32) -> Self {
        Self {
            index: item.index,
            job_id: item.job_id.clone(),
            payload: item.payload.clone(),
            output,
            status: ResultStatus::Success,
            model_used: model.to_string(),
            error_kind: None,
            retry_count: (retries > 0).then_some(retries),
            outputs: Vec::new(),
        }
    }

    pub fn failure(item: &WorkItem, kind: ErrorKind, message: &str, model: &str, retries: u32) -> Self {
        Self {
            index: item.index,
            job_id: item.job_id.clone(),
            payload: item.payload.clone(),
            output: failure_text(kind, message),
            status: ResultStatus::Error,
            model_used: model.to_string(),
            error_kind: Some(kind),
            retry_count: Some(retries),
            outputs: Vec::new(),
        }
    }

    /// Stand-in for a result that was lost or unreadable.
    pub fn placeholder(index: usize, job_id: &str, kind: ErrorKind, message: &str) -> Self {
        Self {
            index,
            job_id: job_id.to_string(),
            payload: Payload::new(),
            output: format!("{ERROR_MARKER}: {message}"),
            status: ResultStatus::Error,
            model_used: "none".to_string(),
            error_kind: Some(kind),
            retry_count: None,
            outputs: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(index: usize) -> WorkItem {
        let mut payload = Payload::new();
        payload.insert("name".into(), json!("Ada"));
        WorkItem {
            index,
            payload,
            job_id: "job-1".into(),
        }
    }

    #[test]
    fn job_items_use_list_position_as_index() {
        let job = Job::new(3);
        let rows = vec![Payload::new(), Payload::new(), Payload::new()];
        let items = job.items(rows);
        let indices: Vec<usize> = items.iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(items.iter().all(|i| i.job_id == job.id));
    }

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 1000,
        };
        assert_eq!(config.delay_for_attempt(1), 1000);
        assert_eq!(config.delay_for_attempt(2), 2000);
        assert_eq!(config.delay_for_attempt(3), 4000);
        assert_eq!(config.delay_for_attempt(4), 8000);
    }

    #[test]
    fn retry_delay_saturates_instead_of_overflowing() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(200), u64::MAX);
    }

    #[test]
    fn failure_embeds_marker_in_output() {
        let r = WorkerResult::failure(&item(2), ErrorKind::Timeout, "request timed out", "m", 3);
        assert_eq!(r.output, "ERROR: request timed out");
        assert_eq!(r.status, ResultStatus::Error);
        assert_eq!(r.retry_count, Some(3));
        assert_eq!(r.payload["name"], json!("Ada"));

        let q = WorkerResult::failure(&item(2), ErrorKind::QuotaExhausted, "daily cap", "m", 0);
        assert!(q.output.starts_with("DAILY_LIMIT_HIT: "));
    }

    #[test]
    fn success_omits_zero_retry_count() {
        let r = WorkerResult::success(&item(0), "hello".into(), "m", 0);
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("retry_count").is_none());
        assert!(json.get("error_kind").is_none());
        assert_eq!(json["status"], "success");
    }

    #[test]
    fn single_step_rows_omit_outputs() {
        let r = WorkerResult::success(&item(0), "hello".into(), "m", 0);
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("outputs").is_none());

        let mut seq = r.clone();
        seq.outputs = vec![
            StepOutput::new("initial_email", "hello"),
            StepOutput::skipped("followup_1", "initial_email"),
        ];
        let json = serde_json::to_value(&seq).unwrap();
        assert_eq!(json["outputs"][1]["text"], "SKIPPED: initial_email failed");
        let back: WorkerResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, seq);
    }

    #[test]
    fn unknown_error_kind_decodes() {
        let kind: ErrorKind = serde_json::from_str(r#""brand_new_kind""#).unwrap();
        assert_eq!(kind, ErrorKind::Unknown);
    }

    #[test]
    fn model_used_defaults_when_absent() {
        let r: WorkerResult = serde_json::from_value(json!({
            "index": 4,
            "payload": {},
            "output": "hi",
            "status": "success"
        }))
        .unwrap();
        assert_eq!(r.model_used, "unknown");
        assert_eq!(r.job_id, "");
    }
}
