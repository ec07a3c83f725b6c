use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Lifecycle label of a job.
///
/// A job flows QUEUED → PROCESSING → one terminal label. Terminal labels never
/// change again except to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Processing,
    Success,
    Partial { succeeded: usize, total: usize },
    FailedAll { errors: usize },
    CombineFailure,
    ChordCreationFailed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Processing)
    }

    /// Whether a stored status may be replaced by `next`.
    ///
    /// - Non-terminal statuses accept anything.
    /// - Terminal statuses accept an identical rewrite or `Cancelled`.
    /// - `Cancelled` accepts only itself.
    pub fn can_transition_to(&self, next: &JobStatus) -> bool {
        match self {
            JobStatus::Queued | JobStatus::Processing => true,
            JobStatus::Cancelled => *next == JobStatus::Cancelled,
            terminal => terminal == next || *next == JobStatus::Cancelled,
        }
    }

    /// Terminal label for a finished batch given its success and error counts.
    pub fn from_counts(succeeded: usize, errors: usize, total: usize) -> Self {
        if succeeded == total && errors == 0 {
            JobStatus::Success
        } else if succeeded > 0 {
            JobStatus::Partial { succeeded, total }
        } else {
            JobStatus::FailedAll { errors }
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Processing => write!(f, "PROCESSING"),
            JobStatus::Success => write!(f, "SUCCESS"),
            JobStatus::Partial { succeeded, total } => write!(f, "PARTIAL_{succeeded}_OF_{total}"),
            JobStatus::FailedAll { errors } => write!(f, "FAILED_ALL_{errors}_ERRORS"),
            JobStatus::CombineFailure => write!(f, "COMBINE_FAILURE"),
            JobStatus::ChordCreationFailed => write!(f, "CHORD_CREATION_FAILED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "QUEUED" => JobStatus::Queued,
            "PROCESSING" => JobStatus::Processing,
            "SUCCESS" => JobStatus::Success,
            "COMBINE_FAILURE" => JobStatus::CombineFailure,
            "CHORD_CREATION_FAILED" => JobStatus::ChordCreationFailed,
            "CANCELLED" => JobStatus::Cancelled,
            other => parse_counted(other).ok_or_else(|| StoreError::Corrupt(format!("unknown status label `{other}`")))?,
        };
        Ok(status)
    }
}

fn parse_counted(label: &str) -> Option<JobStatus> {
    if let Some(rest) = label.strip_prefix("PARTIAL_") {
        let (succeeded, total) = rest.split_once("_OF_")?;
        return Some(JobStatus::Partial {
            succeeded: succeeded.parse().ok()?,
            total: total.parse().ok()?,
        });
    }
    let errors = label.strip_prefix("FAILED_ALL_")?.strip_suffix("_ERRORS")?;
    Some(JobStatus::FailedAll {
        errors: errors.parse().ok()?,
    })
}

/// Persisted `{status, progress, total}` tuple for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub status: JobStatus,
    pub progress: usize,
    pub total: usize,
}

impl JobStatusRecord {
    pub fn new(status: JobStatus, progress: usize, total: usize) -> Self {
        Self {
            status,
            progress,
            total,
        }
    }

    /// Status file form: `status,progress,total`.
    pub fn to_line(&self) -> String {
        format!("{},{},{}", self.status, self.progress, self.total)
    }

    pub fn parse_line(line: &str) -> Result<Self, StoreError> {
        let parts: Vec<&str> = line.trim().split(',').collect();
        let [status, progress, total] = parts.as_slice() else {
            return Err(StoreError::Corrupt(format!(
                "status line must have 3 fields, got {}",
                parts.len()
            )));
        };
        let number = |field: &str| {
            field
                .parse::<usize>()
                .map_err(|e| StoreError::Corrupt(format!("bad number `{field}`: {e}")))
        };
        Ok(Self {
            status: status.parse()?,
            progress: number(progress)?,
            total: number(total)?,
        })
    }
}
