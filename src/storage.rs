//! SQL layer for the job ledger.
//!
//! All dispatcher-side mutation goes through here. The claim combines its
//! locking read and the `pending -> running` transition in one transaction,
//! and every settlement is guarded by `status = 'running'`, so terminal rows
//! are never touched again and no two dispatchers can execute the same
//! attempt.

use crate::schema::Job;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, job_type, payload, status, priority, attempts, max_attempts, \
     last_error, scheduled_at, started_at, completed_at, created_at";

/// Claims up to `limit` due pending jobs and marks them running.
///
/// The `FOR UPDATE SKIP LOCKED` read and the status update commit in the same
/// transaction. This is the invariant that lets any number of dispatcher
/// processes share one database: a row selected here is locked until it is
/// visibly `running`, so a concurrent claimant skips it rather than racing.
pub(crate) async fn claim_due_jobs(pool: &PgPool, limit: i64) -> Result<Vec<Job>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let jobs = sqlx::query_as::<_, Job>(&format!(
        r"
        UPDATE jobs
        SET status = 'running', started_at = NOW()
        WHERE id IN (
            SELECT id FROM jobs
            WHERE status = 'pending' AND scheduled_at <= NOW()
            ORDER BY priority DESC, scheduled_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT $1
        )
        RETURNING {JOB_COLUMNS}
        ",
    ))
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(jobs)
}

/// Marks a running job as completed, merging any handler result data into
/// the payload and clearing the last error.
pub(crate) async fn complete_job(
    pool: &PgPool,
    job_id: Uuid,
    data: Option<Value>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE jobs
        SET status = 'completed',
            attempts = attempts + 1,
            completed_at = NOW(),
            last_error = NULL,
            payload = payload || COALESCE($2, '{}'::jsonb)
        WHERE id = $1 AND status = 'running'
        ",
    )
    .bind(job_id)
    .bind(data)
    .execute(pool)
    .await?;
    Ok(())
}

/// Records a failed attempt and reschedules the job for a later retry.
///
/// `started_at` and `completed_at` stay untouched; a rescheduled row is
/// recognizable as pending-with-history.
pub(crate) async fn reschedule_failed_job(
    pool: &PgPool,
    job_id: Uuid,
    error: &str,
    next_attempt_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE jobs
        SET status = 'pending',
            attempts = attempts + 1,
            last_error = $2,
            scheduled_at = $3
        WHERE id = $1 AND status = 'running'
        ",
    )
    .bind(job_id)
    .bind(error)
    .bind(next_attempt_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Records a failed attempt that exhausted the attempt budget. Terminal.
pub(crate) async fn fail_job(pool: &PgPool, job_id: Uuid, error: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE jobs
        SET status = 'failed',
            attempts = attempts + 1,
            last_error = $2,
            completed_at = NOW()
        WHERE id = $1 AND status = 'running'
        ",
    )
    .bind(job_id)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetches a single job row by id.
pub(crate) async fn find_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Moves a failed job back to pending with a fresh attempt budget.
///
/// This is the only sanctioned way back out of `failed`: attempts are reset
/// and the failure bookkeeping is cleared together with the status, never the
/// status alone. Returns `false` when the row is missing or not failed.
pub(crate) async fn retry_failed_job(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE jobs
        SET status = 'pending',
            attempts = 0,
            last_error = NULL,
            started_at = NULL,
            completed_at = NULL,
            scheduled_at = NOW()
        WHERE id = $1 AND status = 'failed'
        ",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// The number of jobs that are pending, whether due now or scheduled later.
pub(crate) async fn pending_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE status = 'pending'")
        .fetch_one(pool)
        .await
}

/// The number of jobs parked in the terminal failed state.
pub(crate) async fn failed_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE status = 'failed'")
        .fetch_one(pool)
        .await
}
