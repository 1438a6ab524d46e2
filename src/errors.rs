use thiserror::Error;

/// Errors surfaced by the public queue API.
///
/// Storage errors are wrapped verbatim; everything else is raised
/// synchronously at the API boundary and never persisted.
#[derive(Error, Debug)]
pub enum JobQueueError {
    /// An error occurred while executing an SQL query
    #[error("error while executing query: {0}")]
    Sql(#[from] sqlx::Error),

    /// An error occurred while serializing or deserializing JSON data
    #[error("error while serializing JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The queue has been closed; no further operations are accepted
    #[error("job queue closed")]
    Closed,

    /// The job failed validation before it could be persisted
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The bundle failed validation before it could be persisted
    #[error("invalid job bundle: {0}")]
    InvalidBundle(String),

    /// A worker function is already registered for this job type
    #[error("a worker for job type '{0}' is already registered")]
    WorkerAlreadyRegistered(String),

    /// A retry scheduler is already registered for this job type
    #[error("a retry scheduler for job type '{0}' is already registered")]
    RetrySchedulerAlreadyRegistered(String),

    /// A job failed with retries remaining but no scheduler is registered
    #[error("no retry scheduler registered for job type '{0}'")]
    NoRetryScheduler(String),

    /// No worker function is registered for this job type
    #[error("no worker for job of type '{0}'")]
    NoWorker(String),

    /// A synchronously executed worker function failed or panicked
    #[error("job worker failed: {0}")]
    WorkerFailed(String),

    #[error("worker threads already running")]
    WorkersAlreadyRunning,

    #[error("need at least 1 worker thread")]
    NoWorkerThreads,

    #[error("polling interval must be greater than zero")]
    InvalidPollInterval,

    #[error("missing database_url config")]
    MissingDatabaseUrl,
}

pub type Result<T> = core::result::Result<T, JobQueueError>;
