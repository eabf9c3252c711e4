//! Execution supervisor: runs one claimed job and settles its row.

use crate::backoff::backoff;
use crate::job_registry::{HandlerRegistry, JobOutcome};
use crate::schema::Job;
use crate::storage;
use crate::util::panic_message;
use chrono::Utc;
use futures_util::FutureExt;
use sqlx::PgPool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, error, info_span, warn};

/// Run a claimed (already `running`) job to settlement.
///
/// The handler runs under a wall-clock timeout; a panic, a timeout, and a
/// [`JobOutcome::Failure`] are treated uniformly as a failed attempt. The row
/// ends up completed, rescheduled with backoff, or failed.
pub(crate) async fn run_claimed_job<Context: Clone + Send + Sync + 'static>(
    pool: &PgPool,
    context: Context,
    registry: Arc<HandlerRegistry<Context>>,
    job: Job,
    timeout: Duration,
) {
    let span = info_span!("job", job.id = %job.id, job.type = %job.job_type);

    let outcome = execute(context, &registry, &job, timeout)
        .instrument(span.clone())
        .await;

    let _enter = span.enter();
    let settled = match outcome {
        JobOutcome::Success { data } => {
            debug!("Job succeeded");
            storage::complete_job(pool, job.id, data).await
        }
        JobOutcome::Failure { error } => {
            // Attempts are counted after this failed attempt; the row still
            // holds the pre-increment value.
            let attempts_after = job.attempts + 1;
            if attempts_after < job.max_attempts {
                let delay = backoff(attempts_after as u32);
                warn!(%error, attempts = attempts_after, "Job failed, retrying in {delay:?}");
                let next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60));
                storage::reschedule_failed_job(pool, job.id, &error, next_attempt_at).await
            } else {
                warn!(%error, attempts = attempts_after, "Job failed permanently");
                storage::fail_job(pool, job.id, &error).await
            }
        }
    };

    // A failed settlement orphans the row in `running`; handlers must already
    // tolerate re-execution, so we only report it.
    if let Err(error) = settled {
        error!(%error, "Failed to persist job outcome");
    }
}

async fn execute<Context: Clone + Send + Sync + 'static>(
    context: Context,
    registry: &HandlerRegistry<Context>,
    job: &Job,
    timeout: Duration,
) -> JobOutcome {
    let Some(handler) = registry.get(&job.job_type) else {
        return JobOutcome::failure(format!(
            "no handler registered for job type {:?}",
            job.job_type
        ));
    };

    debug!("Running job…");
    let future = AssertUnwindSafe(handler(context, job.payload.clone())).catch_unwind();

    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(panic)) => JobOutcome::failure(panic_message(&*panic)),
        Err(_) => JobOutcome::failure(format!("job timed out after {timeout:?}")),
    }
}
