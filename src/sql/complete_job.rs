use chrono::{DateTime, Utc};
use indoc::formatdoc;
use sqlx::{query, query_scalar, PgExecutor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::errors::Result;

/// Persists a successful outcome and bumps the bundle counter.
///
/// An empty or null result is normalized to a literal empty object so
/// observers can distinguish "completed without payload" from "still
/// running".
pub async fn set_job_result(
    pool: &PgPool,
    escaped_schema: &str,
    job_id: Uuid,
    result: Option<serde_json::Value>,
) -> Result<()> {
    let result = match result {
        None | Some(serde_json::Value::Null) => serde_json::json!({}),
        Some(value) => value,
    };

    let mut tx = pool.begin().await?;

    let sql = formatdoc!(
        r#"
            update {escaped_schema}.job
                set result = $1, stopped_at = now(), error_msg = null, error_data = null,
                    updated_at = now()
                where id = $2
        "#
    );
    query(&sql)
        .bind(result)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

    increment_bundle_counter(&mut tx, escaped_schema, job_id).await?;

    tx.commit().await?;
    Ok(())
}

/// Persists a failed outcome.
///
/// `final_stop` is resolved by the completion engine: only a job that will
/// not be retried counts towards its bundle. A job about to be rescheduled
/// is not finished, so its bundle counter stays untouched.
pub async fn set_job_error(
    pool: &PgPool,
    escaped_schema: &str,
    job_id: Uuid,
    error_msg: &str,
    error_data: Option<serde_json::Value>,
    final_stop: bool,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    let sql = formatdoc!(
        r#"
            update {escaped_schema}.job
                set stopped_at = now(), error_msg = $1, error_data = $2, updated_at = now()
                where id = $3
        "#
    );
    query(&sql)
        .bind(error_msg)
        .bind(error_data)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

    if final_stop {
        increment_bundle_counter(&mut tx, escaped_schema, job_id).await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Clears a failed job back to pending with the incremented retry counter.
///
/// The job is not finished, so the bundle counter is left alone. The
/// update trigger emits `job_available` for the transition back to
/// pending.
pub async fn schedule_retry<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    job_id: Uuid,
    next_start: DateTime<Utc>,
    retry_count: i32,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.job
                set start_at = $1,
                    started_at = null,
                    stopped_at = null,
                    error_msg = null,
                    error_data = null,
                    current_retry_count = $2,
                    updated_at = now()
                where id = $3
        "#
    );

    query(&sql)
        .bind(next_start)
        .bind(retry_count)
        .bind(job_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Reschedules a job to a new start time, clearing its execution state.
pub async fn set_job_start<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    job_id: Uuid,
    start_at: DateTime<Utc>,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.job
                set start_at = $1,
                    started_at = null,
                    stopped_at = null,
                    error_msg = null,
                    error_data = null,
                    updated_at = now()
                where id = $2
        "#
    );

    query(&sql)
        .bind(start_at)
        .bind(job_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Looks up the job's bundle under a blocking row lock and increments
/// `num_jobs_stopped`.
///
/// Plain `for update`, not `skip locked`: every completing job of a given
/// bundle must update that specific row. Skipping would lose increments
/// and leave the bundle permanently short of its terminal state. Waiting
/// on a peer transaction here is the intended serialization point.
pub(crate) async fn increment_bundle_counter(
    tx: &mut Transaction<'_, Postgres>,
    escaped_schema: &str,
    job_id: Uuid,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            select b.id
                from {escaped_schema}.job_bundle as b
                inner join {escaped_schema}.job as j on j.bundle_id = b.id
                where j.id = $1
                for update of b
        "#
    );
    let bundle_id: Option<Uuid> = query_scalar(&sql)
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?;

    let Some(bundle_id) = bundle_id else {
        return Ok(());
    };

    let sql = formatdoc!(
        r#"
            update {escaped_schema}.job_bundle
                set num_jobs_stopped = num_jobs_stopped + 1, updated_at = now()
                where id = $1
        "#
    );
    query(&sql).bind(bundle_id).execute(&mut **tx).await?;

    Ok(())
}
