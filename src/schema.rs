//! Database schema definitions for SQLx.
//!
//! This module contains the database types and structures for the job ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Lifecycle status of a [`Job`].
///
/// `Completed` and `Failed` are terminal: once a row reaches either, this
/// crate never mutates it again. A `Pending` row with a non-null `started_at`
/// has failed at least once and is waiting out its retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to become eligible for claiming.
    Pending,
    /// Claimed by a dispatcher and currently executing.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Attempt budget exhausted. Terminal.
    Failed,
}

impl JobStatus {
    /// Whether the row will never be mutated by the dispatcher again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Represents a job record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier, generated at enqueue time.
    pub id: Uuid,
    /// Type identifier for the job (used for dispatch).
    pub job_type: String,
    /// JSON data containing the job payload.
    pub payload: Value,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Priority of the job (higher = claimed first).
    pub priority: i16,
    /// Number of execution attempts made so far.
    pub attempts: i32,
    /// Attempt ceiling for this job.
    pub max_attempts: i32,
    /// Most recent failure message, cleared on success.
    pub last_error: Option<String>,
    /// Earliest time the job becomes eligible for claiming.
    pub scheduled_at: DateTime<Utc>,
    /// Timestamp of the most recent claim; null if never started.
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp of the terminal transition.
    pub completed_at: Option<DateTime<Utc>>,
    /// Timestamp when the job was created.
    pub created_at: DateTime<Utc>,
}

/// Run the bundled migrations, creating the `jobs` table, the `job_status`
/// enum, and the claim-order index if they do not exist yet.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
