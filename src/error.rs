use thiserror::Error;

pub use crate::generator::GenerateError;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Generator error: {0}")]
    Generate(#[from] GenerateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the durable status and result stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("invalid store key `{0}`")]
    InvalidKey(String),

    #[error("job {job_id} is {current}; refusing transition to {requested}")]
    TerminalStatus {
        job_id: String,
        current: String,
        requested: String,
    },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("job {0} has no items")]
    EmptyJob(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("task registration failed: {0}")]
    Registration(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("XLSX error: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    #[error("cell of {len} characters exceeds the {limit} character limit")]
    CellTooLarge { len: usize, limit: usize },

    #[error("table of {rows} rows and {columns} columns does not fit in one worksheet")]
    TableTooLarge { rows: usize, columns: usize },

    #[error("no artifact format succeeded: {0}")]
    AllFormatsFailed(String),
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}
