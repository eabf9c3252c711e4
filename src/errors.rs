/// Errors returned synchronously by the enqueue API.
///
/// Validation failures mean the job was never created. Execution failures are
/// never surfaced here; they are only observable on the job row itself
/// (`status`, `last_error`, `attempts`).
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The job type is empty, too long, or contains characters outside
    /// `[A-Za-z0-9_-]`.
    #[error("invalid job type {0:?}: must be 1-100 characters from [A-Za-z0-9_-]")]
    InvalidJobType(String),

    /// The serialized payload exceeds the configured size cap.
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Serialized payload size.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// The payload is not a JSON object.
    #[error("payload must be a JSON object, got {0}")]
    PayloadNotAnObject(&'static str),

    /// `max_attempts` is outside the accepted `[1, 100]` range.
    #[error("max_attempts {0} is outside the accepted range [1, 100]")]
    InvalidMaxAttempts(i32),

    /// `priority` is outside the accepted `[0, 1000]` range.
    #[error("priority {0} is outside the accepted range [0, 1000]")]
    InvalidPriority(i32),

    /// The requested schedule lies more than one year in the future.
    #[error("scheduled_at {0} is more than one year in the future")]
    ScheduleTooFarAhead(chrono::DateTime<chrono::Utc>),

    /// The payload could not be serialized for the size check.
    #[error("failed to serialize payload")]
    Serialization(#[from] serde_json::Error),

    /// The insert itself failed.
    #[error("failed to enqueue job")]
    Database(#[from] sqlx::Error),
}
