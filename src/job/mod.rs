mod item;
mod record;
mod status;

pub use item::{
    DAILY_LIMIT_MARKER, ERROR_MARKER, ErrorKind, Job, Payload, ResultStatus, RetryConfig, SKIPPED_MARKER, Step,
    StepOutput, WorkItem, WorkerResult, failure_text,
};
pub use record::TaskRecord;
pub use status::{JobStatus, JobStatusRecord};
