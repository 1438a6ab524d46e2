use indoc::formatdoc;
use sqlx::{query_as, PgExecutor, PgPool};
use uuid::Uuid;

use crate::bundle::JobBundle;
use crate::errors::Result;
use crate::job::Job;

/// Fetches a single job snapshot, or `None` if it does not exist.
pub async fn get_job<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    job_id: Uuid,
) -> Result<Option<Job>> {
    let sql = format!("select * from {escaped_schema}.job where id = $1");

    let job = query_as(&sql).bind(job_id).fetch_optional(executor).await?;
    Ok(job)
}

/// Fetches a bundle together with all of its member jobs.
///
/// Both reads happen inside one transaction so the snapshot is consistent
/// with the bundle counters.
pub async fn get_bundle_with_jobs(
    pool: &PgPool,
    escaped_schema: &str,
    bundle_id: Uuid,
) -> Result<Option<JobBundle>> {
    let mut tx = pool.begin().await?;

    let bundle_sql = format!("select * from {escaped_schema}.job_bundle where id = $1");
    let bundle: Option<JobBundle> = query_as(&bundle_sql)
        .bind(bundle_id)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(bundle) = bundle else {
        tx.commit().await?;
        return Ok(None);
    };

    let jobs_sql = formatdoc!(
        r#"
            select *
                from {escaped_schema}.job
                where bundle_id = $1
                order by created_at
        "#
    );
    let jobs: Vec<Job> = query_as(&jobs_sql)
        .bind(bundle_id)
        .fetch_all(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(Some(bundle.with_jobs(jobs)))
}
