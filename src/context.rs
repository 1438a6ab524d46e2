use std::sync::Arc;

use getset::Getters;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::Job;

/// Everything a worker function or retry scheduler gets handed for one job.
///
/// Carries the job snapshot, database access for user code that needs to
/// issue its own queries, and a per-job cancellation token derived from
/// the pool's parent token. Cancellation asks the user code to stop; the
/// worker still persists the outcome before exiting.
#[derive(Clone, Getters)]
#[getset(get = "pub")]
pub struct JobContext {
    /// Database connection pool shared with the queue
    pg_pool: PgPool,
    /// Schema name (properly escaped for SQL)
    escaped_schema: String,
    /// The job being worked on
    job: Arc<Job>,
    #[getset(skip)]
    cancellation: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        pg_pool: PgPool,
        escaped_schema: String,
        job: Arc<Job>,
        cancellation: CancellationToken,
    ) -> Self {
        JobContext {
            pg_pool,
            escaped_schema,
            job,
            cancellation,
        }
    }

    pub fn job_id(&self) -> Uuid {
        *self.job.id()
    }

    /// Completes when the worker pool is shutting down or the job timed
    /// out; long-running workers should select on this.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
