use thiserror::Error;

/// Errors surfaced by the engine core.
///
/// Timeouts and command failures are deliberately absent: they are recorded
/// run outcomes, not errors (the scheduler loop must survive them).
#[derive(Debug, Error)]
pub enum Error {
    /// Cron expression rejected at parse time. `field` is the zero-based
    /// index of the offending field within the five-field expression.
    #[error("invalid cron expression at field {field}: {reason}")]
    InvalidCron { field: usize, reason: String },

    #[error("a job named '{0}' already exists")]
    DuplicateName(String),

    #[error("no job named '{0}'")]
    NotFound(String),

    #[error("no run with id {0}")]
    RunNotFound(i64),

    #[error("job '{0}' is already running")]
    AlreadyRunning(String),

    #[error("timeout_seconds must be positive")]
    InvalidTimeout,

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
