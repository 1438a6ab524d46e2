use chrono::{DateTime, Utc};
use getset::Getters;
use indoc::formatdoc;
use sqlx::{query_as, FromRow, PgExecutor};

use crate::errors::Result;
use crate::job::Job;

/// Aggregate counts over the whole queue.
#[derive(FromRow, Getters, Debug, Clone, Copy, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct QueueStatus {
    num_jobs: i64,
    num_bundles: i64,
}

pub async fn get_status<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
) -> Result<QueueStatus> {
    let sql = formatdoc!(
        r#"
            select
                (select count(*) from {escaped_schema}.job)        as num_jobs,
                (select count(*) from {escaped_schema}.job_bundle) as num_bundles
        "#
    );
    let status = query_as(&sql).fetch_one(executor).await?;
    Ok(status)
}

/// All jobs that have not reached a final state, soonest first.
pub async fn list_jobs_to_do<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
) -> Result<Vec<Job>> {
    let sql = formatdoc!(
        r#"
            select *
                from {escaped_schema}.job
                where stopped_at is null
                order by start_at nulls first, created_at
        "#
    );
    let jobs = query_as(&sql).fetch_all(executor).await?;
    Ok(jobs)
}

/// All jobs currently stopped with an error, oldest stop first.
pub async fn list_jobs_with_errors<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
) -> Result<Vec<Job>> {
    let sql = formatdoc!(
        r#"
            select *
                from {escaped_schema}.job
                where error_msg is not null
                order by stopped_at
        "#
    );
    let jobs = query_as(&sql).fetch_all(executor).await?;
    Ok(jobs)
}

/// Jobs claimed before `before` and still running.
///
/// In multi-instance deployments this is the basis for deciding which
/// rows are truly abandoned, instead of the single-instance
/// dangling-started reset.
pub async fn list_jobs_started_before<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    before: DateTime<Utc>,
) -> Result<Vec<Job>> {
    let sql = formatdoc!(
        r#"
            select *
                from {escaped_schema}.job
                where started_at is not null
                    and started_at < $1
                    and stopped_at is null
                order by started_at
        "#
    );
    let jobs = query_as(&sql).bind(before).fetch_all(executor).await?;
    Ok(jobs)
}
