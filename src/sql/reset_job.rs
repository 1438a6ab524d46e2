use indoc::formatdoc;
use sqlx::{query, query_as, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::errors::Result;

/// Resets the processing state of a job so it is ready to be re-processed.
///
/// Returns the number of jobs reset (0 when the id does not exist).
pub async fn reset_job(pool: &PgPool, escaped_schema: &str, job_id: Uuid) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let reset = reset_job_in_tx(&mut tx, escaped_schema, job_id).await?;
    tx.commit().await?;
    Ok(reset)
}

/// Resets multiple jobs within one transaction.
pub async fn reset_jobs(pool: &PgPool, escaped_schema: &str, job_ids: &[Uuid]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut reset = 0;
    for job_id in job_ids {
        reset += reset_job_in_tx(&mut tx, escaped_schema, *job_id).await?;
    }
    tx.commit().await?;
    Ok(reset)
}

/// The reset itself, atomic with the bundle counter adjustment.
///
/// Whether the job was counted towards its bundle is observed inside the
/// transaction, under the job's row lock: a job counts iff it is stopped
/// and either succeeded or exhausted its retries. Only then is
/// `num_jobs_stopped` decremented, preserving
/// `num_jobs_stopped == |final-state jobs in bundle|`. Resetting a pending
/// or mid-retry job is a no-op on the counter.
async fn reset_job_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    escaped_schema: &str,
    job_id: Uuid,
) -> Result<u64> {
    let sql = formatdoc!(
        r#"
            select bundle_id,
                   (stopped_at is not null
                    and (error_msg is null or current_retry_count >= max_retry_count)) as counted
                from {escaped_schema}.job
                where id = $1
                for update
        "#
    );
    let row: Option<(Option<Uuid>, bool)> = query_as(&sql)
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?;

    let Some((bundle_id, counted)) = row else {
        return Ok(0);
    };

    let sql = formatdoc!(
        r#"
            update {escaped_schema}.job
                set started_at = null,
                    stopped_at = null,
                    error_msg = null,
                    error_data = null,
                    result = null,
                    updated_at = now()
                where id = $1
        "#
    );
    query(&sql).bind(job_id).execute(&mut **tx).await?;

    if counted {
        if let Some(bundle_id) = bundle_id {
            // Blocking lock, same as the completion-side increment.
            let sql = formatdoc!(
                r#"
                    select id from {escaped_schema}.job_bundle where id = $1 for update
                "#
            );
            query(&sql).bind(bundle_id).execute(&mut **tx).await?;

            let sql = formatdoc!(
                r#"
                    update {escaped_schema}.job_bundle
                        set num_jobs_stopped = num_jobs_stopped - 1, updated_at = now()
                        where id = $1 and num_jobs_stopped > 0
                "#
            );
            query(&sql).bind(bundle_id).execute(&mut **tx).await?;
        }
    }

    Ok(1)
}
