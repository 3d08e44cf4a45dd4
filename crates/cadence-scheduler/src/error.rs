use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A job record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The recurrence string is malformed or starts in the past.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// An ISO-8601 duration (delay or epsilon) could not be parsed.
    #[error("Invalid duration {input:?}: {reason}")]
    InvalidDuration { input: String, reason: String },

    /// The job payload is missing required fields.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Template delimiters or placeholders are unusable.
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    /// No job with the given ID exists in the cache or store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The job is disabled and refused to run.
    #[error("Job {id} cannot run, as it is disabled")]
    JobDisabled { id: String },

    /// A local command exited unsuccessfully.
    #[error("Command failed ({status}): {output}")]
    CommandFailed { status: String, output: String },

    /// A remote job got a status outside its expected codes.
    #[error("Unexpected response status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// Transport-level failure of a remote job.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Spawning or waiting on a child process failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The job store was closed and accepts no more calls.
    #[error("Job store is closed")]
    StoreClosed,

    /// A persistence sweep finished with failures.
    #[error("Persistence failed for {failed} of {total} jobs: {first}")]
    Persistence {
        failed: usize,
        total: usize,
        first: String,
    },
}

impl SchedulerError {
    /// Short error code string returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            SchedulerError::InvalidDuration { .. } => "INVALID_DURATION",
            SchedulerError::InvalidJob(_) => "INVALID_JOB",
            SchedulerError::InvalidTemplate(_) => "INVALID_TEMPLATE",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::JobDisabled { .. } => "JOB_DISABLED",
            SchedulerError::CommandFailed { .. } => "COMMAND_FAILED",
            SchedulerError::UnexpectedStatus { .. } => "UNEXPECTED_STATUS",
            SchedulerError::Http(_) => "HTTP_ERROR",
            SchedulerError::Io(_) => "IO_ERROR",
            SchedulerError::StoreClosed => "STORE_CLOSED",
            SchedulerError::Persistence { .. } => "PERSISTENCE_ERROR",
        }
    }

    /// Configuration errors are reported synchronously and never scheduled.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidSchedule(_)
                | SchedulerError::InvalidDuration { .. }
                | SchedulerError::InvalidJob(_)
                | SchedulerError::InvalidTemplate(_)
        )
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        SchedulerError::JobNotFound { id: id.into() }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
