//! Dispatcher configuration, with environment loading.

use std::str::FromStr;
use std::time::Duration;

/// A malformed configuration environment variable.
#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {variable}")]
pub struct ConfigError {
    /// The offending environment variable.
    pub variable: &'static str,
    /// The value that failed to parse.
    pub value: String,
}

/// Tunables for a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long to sleep between polls when no work was claimed.
    /// Default 1 second.
    pub poll_interval: Duration,
    /// Upper bound of the random jitter added to each poll sleep, to spread
    /// out concurrent workers. Default 100 ms.
    pub jitter: Duration,
    /// Cap on concurrently executing jobs per dispatcher. Default 10.
    pub max_concurrent_jobs: usize,
    /// Wall-clock timeout per job execution. Default 60 seconds.
    pub job_timeout: Duration,
    /// How long [`stop`](crate::DispatcherHandle::stop) waits for in-flight
    /// jobs by default. Default 30 seconds.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            jitter: Duration::from_millis(100),
            max_concurrent_jobs: 10,
            job_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    /// Load the configuration from the environment, falling back to the
    /// defaults for unset variables.
    ///
    /// Recognized variables: `JOBQ_POLL_INTERVAL_MS`, `JOBQ_JITTER_MS`,
    /// `JOBQ_MAX_CONCURRENT_JOBS`, `JOBQ_JOB_TIMEOUT_MS`,
    /// `JOBQ_SHUTDOWN_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: env_duration_ms("JOBQ_POLL_INTERVAL_MS", defaults.poll_interval)?,
            jitter: env_duration_ms("JOBQ_JITTER_MS", defaults.jitter)?,
            max_concurrent_jobs: env_parse(
                "JOBQ_MAX_CONCURRENT_JOBS",
                defaults.max_concurrent_jobs,
            )?,
            job_timeout: env_duration_ms("JOBQ_JOB_TIMEOUT_MS", defaults.job_timeout)?,
            shutdown_timeout: env_duration_ms(
                "JOBQ_SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout,
            )?,
        })
    }
}

fn env_parse<T: FromStr>(variable: &'static str, default: T) -> Result<T, ConfigError> {
    parse_value(variable, std::env::var(variable).ok(), default)
}

fn env_duration_ms(variable: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = env_parse(variable, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn parse_value<T: FromStr>(
    variable: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(value) => value.parse().map_err(|_| ConfigError { variable, value }),
        None => Ok(default),
    }
}
