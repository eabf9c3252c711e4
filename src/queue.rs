//! The enqueue and query API.

use crate::errors::EnqueueError;
use crate::schema::{Job, JobStatus};
use crate::storage;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

/// Maximum length of a job type name.
pub const MAX_JOB_TYPE_LEN: usize = 100;
/// Default cap on the serialized payload size, in bytes.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
/// Accepted range for [`EnqueueOptions::max_attempts`].
pub const MAX_ATTEMPTS_RANGE: std::ops::RangeInclusive<i32> = 1..=100;
/// Accepted range for [`EnqueueOptions::priority`].
pub const PRIORITY_RANGE: std::ops::RangeInclusive<i32> = 0..=1000;

const MAX_SCHEDULE_AHEAD_DAYS: i64 = 365;

/// Per-job options accepted by [`JobQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Delay before the job becomes eligible, in milliseconds. Ignored when
    /// [`scheduled_at`](Self::scheduled_at) is set.
    pub delay_ms: u64,
    /// Absolute eligibility time; takes precedence over the delay.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Attempt ceiling, in `[1, 100]`.
    pub max_attempts: i32,
    /// Claim priority, in `[0, 1000]`; higher runs first.
    pub priority: i32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            scheduled_at: None,
            max_attempts: 3,
            priority: 0,
        }
    }
}

impl EnqueueOptions {
    /// Resolve the effective schedule relative to `now`; `scheduled_at` wins
    /// over the delay, and the result may not be more than a year ahead.
    fn resolve_schedule(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, EnqueueError> {
        let scheduled_at = match self.scheduled_at {
            Some(at) => at,
            None => now + ChronoDuration::milliseconds(self.delay_ms.min(i64::MAX as u64) as i64),
        };
        if scheduled_at > now + ChronoDuration::days(MAX_SCHEDULE_AHEAD_DAYS) {
            return Err(EnqueueError::ScheduleTooFarAhead(scheduled_at));
        }
        Ok(scheduled_at)
    }

    fn validate(&self) -> Result<(), EnqueueError> {
        if !MAX_ATTEMPTS_RANGE.contains(&self.max_attempts) {
            return Err(EnqueueError::InvalidMaxAttempts(self.max_attempts));
        }
        if !PRIORITY_RANGE.contains(&self.priority) {
            return Err(EnqueueError::InvalidPriority(self.priority));
        }
        Ok(())
    }
}

/// One item of a batch enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Job type tag selecting the handler.
    pub job_type: String,
    /// Handler payload; must be a JSON object.
    pub payload: Value,
    /// Per-job options.
    pub options: EnqueueOptions,
}

/// What the enqueue caller gets back: the durable identity and schedule of
/// the freshly inserted row.
#[derive(Debug, Clone)]
pub struct JobSummary {
    /// Generated job id.
    pub id: Uuid,
    /// Echo of the job type.
    pub job_type: String,
    /// Always [`JobStatus::Pending`] at enqueue time.
    pub status: JobStatus,
    /// Effective eligibility time.
    pub scheduled_at: DateTime<Utc>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// Handle for enqueueing and inspecting jobs.
///
/// Cheap to clone; constructed explicitly around a [`PgPool`] by the process
/// entry point and passed to whatever accepts work (an HTTP layer, a CLI, a
/// scheduler re-enqueueing recurring work).
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: PgPool,
    max_payload_bytes: usize,
}

impl JobQueue {
    /// Create a queue handle with the default 1 MiB payload cap.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Override the serialized payload size cap.
    pub fn max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    /// Validate and insert a new pending job.
    ///
    /// Validation errors are returned synchronously and mean no row was
    /// created. Execution failures never propagate here; read the job row
    /// back to observe them.
    #[instrument(name = "jobq.enqueue", skip(self, payload), fields(job.type = %job_type))]
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<JobSummary, EnqueueError> {
        validate_job_type(job_type)?;
        validate_payload(&payload, self.max_payload_bytes)?;
        options.validate()?;

        let now = Utc::now();
        let scheduled_at = options.resolve_schedule(now)?;
        let id = Uuid::new_v4();

        let created_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            r"
            INSERT INTO jobs (id, job_type, payload, status, priority, attempts, max_attempts, scheduled_at)
            VALUES ($1, $2, $3, 'pending', $4, 0, $5, $6)
            RETURNING created_at
            ",
        )
        .bind(id)
        .bind(job_type)
        .bind(&payload)
        .bind(options.priority as i16)
        .bind(options.max_attempts)
        .bind(scheduled_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobSummary {
            id,
            job_type: job_type.to_owned(),
            status: JobStatus::Pending,
            scheduled_at,
            created_at,
        })
    }

    /// Enqueue several jobs sequentially.
    ///
    /// This is not atomic: on a failing item the error for that item is
    /// returned and earlier inserts remain committed (at-least-attempted
    /// semantics, not an all-or-nothing batch).
    pub async fn enqueue_batch(&self, jobs: Vec<NewJob>) -> Result<Vec<JobSummary>, EnqueueError> {
        let mut summaries = Vec::with_capacity(jobs.len());
        for job in jobs {
            summaries.push(self.enqueue(&job.job_type, job.payload, job.options).await?);
        }
        Ok(summaries)
    }

    /// Enqueue a job for an absolute point in time.
    pub async fn schedule(
        &self,
        job_type: &str,
        payload: Value,
        at: DateTime<Utc>,
        options: EnqueueOptions,
    ) -> Result<JobSummary, EnqueueError> {
        let options = EnqueueOptions {
            scheduled_at: Some(at),
            ..options
        };
        self.enqueue(job_type, payload, options).await
    }

    /// Read a job row by id.
    pub async fn find_job(&self, id: Uuid) -> Result<Option<Job>, sqlx::Error> {
        storage::find_job(&self.pool, id).await
    }

    /// Move a failed job back to pending with a reset attempt budget.
    ///
    /// Returns `false` when the job does not exist or is not in the failed
    /// state; pending, running and completed rows are left alone.
    pub async fn retry_failed(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        storage::retry_failed_job(&self.pool, id).await
    }

    /// The number of pending jobs, due or not.
    pub async fn pending_count(&self) -> Result<i64, sqlx::Error> {
        storage::pending_count(&self.pool).await
    }

    /// The number of jobs in the terminal failed state.
    pub async fn failed_count(&self) -> Result<i64, sqlx::Error> {
        storage::failed_count(&self.pool).await
    }
}

fn validate_job_type(job_type: &str) -> Result<(), EnqueueError> {
    let ok = !job_type.is_empty()
        && job_type.len() <= MAX_JOB_TYPE_LEN
        && job_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(EnqueueError::InvalidJobType(job_type.to_owned()))
    }
}

fn validate_payload(payload: &Value, max_bytes: usize) -> Result<(), EnqueueError> {
    if !payload.is_object() {
        let kind = match payload {
            Value::Null => "null",
            Value::Bool(_) => "a boolean",
            Value::Number(_) => "a number",
            Value::String(_) => "a string",
            Value::Array(_) => "an array",
            Value::Object(_) => unreachable!(),
        };
        return Err(EnqueueError::PayloadNotAnObject(kind));
    }
    let size = serde_json::to_vec(payload)?.len();
    if size > max_bytes {
        return Err(EnqueueError::PayloadTooLarge {
            size,
            max: max_bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_matches, assert_ok};
    use serde_json::json;

    #[test]
    fn job_type_allows_word_characters() {
        assert_ok!(validate_job_type("backup_export"));
        assert_ok!(validate_job_type("rotate-keys-2"));
        assert_ok!(validate_job_type("A"));
        assert_ok!(validate_job_type(&"x".repeat(100)));
    }

    #[test]
    fn job_type_rejects_empty_long_and_odd_characters() {
        assert_matches!(validate_job_type(""), Err(EnqueueError::InvalidJobType(_)));
        assert_matches!(
            validate_job_type(&"x".repeat(101)),
            Err(EnqueueError::InvalidJobType(_))
        );
        assert_matches!(
            validate_job_type("has space"),
            Err(EnqueueError::InvalidJobType(_))
        );
        assert_matches!(
            validate_job_type("dot.dot"),
            Err(EnqueueError::InvalidJobType(_))
        );
    }

    #[test]
    fn payload_must_be_an_object_within_the_cap() {
        assert_ok!(validate_payload(&json!({"k": "v"}), 1024));
        assert_matches!(
            validate_payload(&json!([1, 2, 3]), 1024),
            Err(EnqueueError::PayloadNotAnObject("an array"))
        );
        assert_matches!(
            validate_payload(&json!({"blob": "x".repeat(2048)}), 1024),
            Err(EnqueueError::PayloadTooLarge { .. })
        );
    }

    #[test]
    fn options_bounds_reject_rather_than_clamp() {
        let ok = EnqueueOptions::default();
        assert_ok!(ok.validate());

        let attempts = EnqueueOptions {
            max_attempts: 0,
            ..Default::default()
        };
        assert_matches!(attempts.validate(), Err(EnqueueError::InvalidMaxAttempts(0)));

        let attempts = EnqueueOptions {
            max_attempts: 101,
            ..Default::default()
        };
        assert_err!(attempts.validate());

        let priority = EnqueueOptions {
            priority: 1001,
            ..Default::default()
        };
        assert_matches!(priority.validate(), Err(EnqueueError::InvalidPriority(1001)));

        let priority = EnqueueOptions {
            priority: -1,
            ..Default::default()
        };
        assert_err!(priority.validate());
    }

    #[test]
    fn absolute_schedule_wins_over_delay() {
        let now = Utc::now();
        let at = now + ChronoDuration::hours(2);
        let options = EnqueueOptions {
            delay_ms: 5_000,
            scheduled_at: Some(at),
            ..Default::default()
        };
        assert_eq!(assert_ok!(options.resolve_schedule(now)), at);
    }

    #[test]
    fn delay_offsets_from_now() {
        let now = Utc::now();
        let options = EnqueueOptions {
            delay_ms: 5_000,
            ..Default::default()
        };
        let scheduled = assert_ok!(options.resolve_schedule(now));
        assert_eq!(scheduled, now + ChronoDuration::milliseconds(5_000));
    }

    #[test]
    fn schedules_beyond_a_year_are_rejected() {
        let now = Utc::now();
        let options = EnqueueOptions {
            scheduled_at: Some(now + ChronoDuration::days(366)),
            ..Default::default()
        };
        assert_matches!(
            options.resolve_schedule(now),
            Err(EnqueueError::ScheduleTooFarAhead(_))
        );

        let edge = EnqueueOptions {
            scheduled_at: Some(now + ChronoDuration::days(364)),
            ..Default::default()
        };
        assert_ok!(edge.resolve_schedule(now));
    }
}
