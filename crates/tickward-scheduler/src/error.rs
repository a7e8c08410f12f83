use thiserror::Error;

/// Errors returned synchronously by the scheduler's public operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression could not be parsed or never fires.
    #[error("Invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    /// A task with this name is already registered.
    #[error("Task already registered: {name}")]
    DuplicateTask { name: String },

    /// No task with this name is registered.
    #[error("Task not found: {name}")]
    UnknownTask { name: String },

    /// The scheduler has been stopped and accepts no further work.
    #[error("Scheduler is stopped")]
    SchedulerStopped,
}

impl SchedulerError {
    pub(crate) fn invalid_schedule(expr: &str, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures talking to the shared lease store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Failures of the lease lock built on top of a [`crate::store::LeaseStore`].
#[derive(Debug, Error)]
pub enum LockError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The token no longer owns the key: it expired, or another owner took it.
    #[error("Lock not held: {key}")]
    NotHeld { key: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
