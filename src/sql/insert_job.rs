use indoc::formatdoc;
use sqlx::{query, PgExecutor, PgPool};
use tracing::debug;

use crate::bundle::JobBundle;
use crate::errors::Result;
use crate::job::Job;

/// Inserts a fully-materialized job row.
///
/// Timestamps and the retry counter use the column defaults; the insert
/// trigger emits the `job_available` ping.
pub async fn insert_job<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    job: &Job,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            insert into {escaped_schema}.job
                (id, bundle_id, "type", payload, priority, origin, max_retry_count, start_at)
                values ($1, $2, $3, $4, $5, $6, $7, $8)
        "#
    );

    query(&sql)
        .bind(job.id())
        .bind(job.bundle_id())
        .bind(job.job_type())
        .bind(job.payload())
        .bind(job.priority())
        .bind(job.origin())
        .bind(job.max_retry_count())
        .bind(job.start_at())
        .execute(executor)
        .await?;

    debug!(job_id = %job.id(), job_type = job.job_type(), "Job added to queue");

    Ok(())
}

/// Atomically inserts a bundle row and every one of its member jobs.
pub async fn insert_bundle(pool: &PgPool, escaped_schema: &str, bundle: &JobBundle) -> Result<()> {
    let mut tx = pool.begin().await?;

    let sql = formatdoc!(
        r#"
            insert into {escaped_schema}.job_bundle (id, "type", origin, num_jobs)
                values ($1, $2, $3, $4)
        "#
    );
    query(&sql)
        .bind(bundle.id())
        .bind(bundle.bundle_type())
        .bind(bundle.origin())
        .bind(bundle.num_jobs())
        .execute(&mut *tx)
        .await?;

    for job in bundle.jobs() {
        insert_job(&mut *tx, escaped_schema, job).await?;
    }

    tx.commit().await?;

    debug!(
        bundle_id = %bundle.id(),
        bundle_type = bundle.bundle_type(),
        num_jobs = bundle.num_jobs(),
        "Job bundle added to queue"
    );

    Ok(())
}
