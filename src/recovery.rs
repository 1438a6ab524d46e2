//! Startup recovery for jobs abandoned by a prior process.

use indoc::formatdoc;
use sqlx::{query_scalar, PgExecutor};

use crate::errors::Result;

/// Resets jobs that were left in an errored state by a shutdown or crash
/// but still have retries remaining.
///
/// A crash between the retry scheduler finishing and its reschedule being
/// persisted leaves a row that looks finally failed while it still has
/// budget; clearing it back to pending lets the next worker pick it up.
/// Always safe to run, in any deployment. Returns the number of jobs
/// reset.
pub async fn reset_interrupted_retryable_jobs<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
) -> Result<u64> {
    let sql = formatdoc!(
        r#"
            with resets as (
                update {escaped_schema}.job
                    set started_at = null,
                        stopped_at = null,
                        error_msg = null,
                        error_data = null,
                        result = null,
                        updated_at = now()
                    where started_at is not null
                        and stopped_at is not null
                        and error_msg is not null
                        and current_retry_count < max_retry_count
                    returning id
            )
            select count(*) from resets
        "#
    );
    let num_reset: i64 = query_scalar(&sql).fetch_one(executor).await?;
    Ok(num_reset as u64)
}

/// Resets jobs that were mid-execution when the process died: `started_at`
/// set, `stopped_at` null, and no worker alive to finish them.
///
/// MUST NOT run when multiple queue instances share the database; another
/// live process may still be executing these rows. Multi-instance setups
/// should inspect `list_jobs_started_before` with a generous threshold
/// instead. Returns the number of jobs reset.
pub async fn reset_dangling_started_jobs<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
) -> Result<u64> {
    let sql = formatdoc!(
        r#"
            with resets as (
                update {escaped_schema}.job
                    set started_at = null,
                        stopped_at = null,
                        error_msg = null,
                        error_data = null,
                        result = null,
                        updated_at = now()
                    where started_at is not null
                        and stopped_at is null
                    returning id
            )
            select count(*) from resets
        "#
    );
    let num_reset: i64 = query_scalar(&sql).fetch_one(executor).await?;
    Ok(num_reset as u64)
}
