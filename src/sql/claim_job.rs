use chrono::{DateTime, Utc};
use indoc::formatdoc;
use sqlx::{query_as, PgExecutor};

use crate::errors::Result;
use crate::job::Job;

/// Atomically claims the next runnable job, or returns `None`.
///
/// Picks the highest-priority eligible row not locked by a competing
/// worker and marks it started in the same statement. `skip locked` is
/// deliberate here: any claimable row is as good as any other, so
/// contention turns into "no row" instead of waiting. The bundle counter
/// updates in [`super::complete_job`] use the opposite, blocking lock
/// mode; the two are not interchangeable.
///
/// Older `created_at` wins among equal priorities so no job starves.
pub async fn start_next_job<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    now: DateTime<Utc>,
    allowed_types: &[String],
) -> Result<Option<Job>> {
    if allowed_types.is_empty() {
        return Ok(None);
    }

    let sql = formatdoc!(
        r#"
            with next_job as (
                select id
                    from {escaped_schema}.job
                    where started_at is null
                        and (start_at is null or start_at <= $1)
                        and "type" = any($2::text[])
                    order by priority desc, created_at asc
                    limit 1
                    for update
                    skip locked
            )
            update {escaped_schema}.job as job
                set started_at = $1, updated_at = $1
                from next_job
                where job.id = next_job.id
                returning job.*
        "#
    );

    let job = query_as(&sql)
        .bind(now)
        .bind(allowed_types)
        .fetch_optional(executor)
        .await?;

    Ok(job)
}
