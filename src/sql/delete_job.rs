use indoc::formatdoc;
use sqlx::{query, PgExecutor, PgPool};
use uuid::Uuid;

use crate::errors::Result;

pub async fn delete_job<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    job_id: Uuid,
) -> Result<u64> {
    let sql = format!("delete from {escaped_schema}.job where id = $1");
    let result = query(&sql).bind(job_id).execute(executor).await?;
    Ok(result.rows_affected())
}

pub async fn delete_jobs_from_origin<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    origin: &str,
) -> Result<u64> {
    let sql = format!("delete from {escaped_schema}.job where origin = $1");
    let result = query(&sql).bind(origin).execute(executor).await?;
    Ok(result.rows_affected())
}

pub async fn delete_jobs_of_type<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    job_type: &str,
) -> Result<u64> {
    let sql = format!(r#"delete from {escaped_schema}.job where "type" = $1"#);
    let result = query(&sql).bind(job_type).execute(executor).await?;
    Ok(result.rows_affected())
}

/// Removes only jobs that are stopped, have no error, and are not part of
/// a bundle. Bundle members are cleaned up with their bundle so the
/// counters stay meaningful.
pub async fn delete_finished_jobs<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
) -> Result<u64> {
    let sql = formatdoc!(
        r#"
            delete from {escaped_schema}.job
                where stopped_at is not null
                    and error_msg is null
                    and bundle_id is null
        "#
    );
    let result = query(&sql).execute(executor).await?;
    Ok(result.rows_affected())
}

/// Deletes a bundle; member jobs go with it via `on delete cascade`.
pub async fn delete_bundle<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    bundle_id: Uuid,
) -> Result<u64> {
    let sql = format!("delete from {escaped_schema}.job_bundle where id = $1");
    let result = query(&sql).bind(bundle_id).execute(executor).await?;
    Ok(result.rows_affected())
}

pub async fn delete_bundles_from_origin<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    origin: &str,
) -> Result<u64> {
    let sql = format!("delete from {escaped_schema}.job_bundle where origin = $1");
    let result = query(&sql).bind(origin).execute(executor).await?;
    Ok(result.rows_affected())
}

pub async fn delete_bundles_of_type<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    bundle_type: &str,
) -> Result<u64> {
    let sql = format!(r#"delete from {escaped_schema}.job_bundle where "type" = $1"#);
    let result = query(&sql).bind(bundle_type).execute(executor).await?;
    Ok(result.rows_affected())
}

pub async fn delete_all_jobs_and_bundles(pool: &PgPool, escaped_schema: &str) -> Result<u64> {
    let mut tx = pool.begin().await?;

    let sql = format!("delete from {escaped_schema}.job_bundle");
    let bundles = query(&sql).execute(&mut *tx).await?;

    let sql = format!("delete from {escaped_schema}.job");
    let jobs = query(&sql).execute(&mut *tx).await?;

    tx.commit().await?;
    Ok(bundles.rows_affected() + jobs.rows_affected())
}
