#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod backoff;
mod config;
mod dispatcher;
mod errors;
mod job_registry;
mod queue;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

pub use self::backoff::backoff;
pub use self::config::{ConfigError, DispatcherConfig};
pub use self::dispatcher::{Dispatcher, DispatcherHandle};
pub use self::errors::EnqueueError;
pub use self::job_registry::{HandlerFn, HandlerRegistry, JobOutcome, handler};
pub use self::queue::{
    DEFAULT_MAX_PAYLOAD_BYTES, EnqueueOptions, JobQueue, JobSummary, MAX_ATTEMPTS_RANGE,
    MAX_JOB_TYPE_LEN, NewJob, PRIORITY_RANGE,
};
pub use self::schema::{Job, JobStatus, setup_database};
