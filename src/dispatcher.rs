//! The polling dispatcher and its shutdown handle.

use crate::config::DispatcherConfig;
use crate::job_registry::{HandlerFn, HandlerRegistry, JobOutcome};
use crate::{storage, worker};
use rand::Rng;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{Instrument, error, info, info_span, trace, warn};
use uuid::Uuid;

/// How often [`DispatcherHandle::stop`] re-checks the in-flight set.
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Polls the job ledger for due work and runs it under a concurrency cap.
///
/// A dispatcher owns its handler registry and configuration and is
/// constructed explicitly by the process entry point; several independently
/// configured dispatchers can coexist in one process, and any number of
/// processes can point their dispatchers at the same database. Claiming is
/// coordinated entirely through row locks, so there is no in-memory
/// coordination to share.
pub struct Dispatcher<Context: Clone + Send + Sync + 'static> {
    pool: PgPool,
    context: Context,
    registry: HandlerRegistry<Context>,
    config: DispatcherConfig,
    shutdown_when_queue_empty: bool,
}

impl<Context: std::fmt::Debug + Clone + Send + Sync + 'static> std::fmt::Debug
    for Dispatcher<Context>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("context", &self.context)
            .field("config", &self.config)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Dispatcher<Context> {
    /// Create a dispatcher with the default configuration and an empty
    /// handler registry.
    pub fn new(pool: PgPool, context: Context) -> Self {
        Self {
            pool,
            context,
            registry: HandlerRegistry::default(),
            config: DispatcherConfig::default(),
            shutdown_when_queue_empty: false,
        }
    }

    /// Replace the whole configuration, e.g. with
    /// [`DispatcherConfig::from_env`].
    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how long to sleep between polls when no work was claimed.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to poll sleeps.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Set the cap on concurrently executing jobs.
    pub fn max_concurrent_jobs(mut self, max_concurrent_jobs: usize) -> Self {
        self.config.max_concurrent_jobs = max_concurrent_jobs;
        self
    }

    /// Set the per-job wall-clock execution timeout.
    pub fn job_timeout(mut self, job_timeout: Duration) -> Self {
        self.config.job_timeout = job_timeout;
        self
    }

    /// Exit the poll loop once the ledger holds no pending jobs and nothing
    /// is in flight, instead of polling forever. Mostly useful in tests and
    /// drain-style batch processes.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Register a handler for `job_type`, replacing any existing one.
    pub fn register<F, Fut>(mut self, job_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobOutcome> + Send + 'static,
    {
        self.registry.register(job_type, handler);
        self
    }

    /// Bulk handler registration.
    pub fn register_many(
        mut self,
        handlers: impl IntoIterator<Item = (String, HandlerFn<Context>)>,
    ) -> Self {
        self.registry.register_many(handlers);
        self
    }

    /// Start the polling loop on the current Tokio runtime.
    pub fn start(&self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let in_flight = Arc::new(Mutex::new(HashSet::new()));

        let poll_loop = PollLoop {
            pool: self.pool.clone(),
            context: self.context.clone(),
            registry: Arc::new(self.registry.clone()),
            config: self.config.clone(),
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            in_flight: Arc::clone(&in_flight),
            shutdown_rx,
        };

        info!("Starting dispatcher…");
        let span = info_span!("dispatcher");
        let join = tokio::spawn(poll_loop.run().instrument(span));

        DispatcherHandle {
            shutdown_tx,
            join,
            in_flight,
            shutdown_timeout: self.config.shutdown_timeout,
        }
    }
}

/// Handle to a started [`Dispatcher`]; stopping and draining go through here.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    shutdown_timeout: Duration,
}

impl DispatcherHandle {
    /// Stop claiming new work and wait up to `timeout` for in-flight jobs.
    ///
    /// Returns `true` if everything drained. On `false` the remaining
    /// executions were not killed; they may still settle after this returns,
    /// and the process lifecycle must account for that race before exiting.
    pub async fn stop(self, timeout: Duration) -> bool {
        info!("Stopping dispatcher…");
        let _ = self.shutdown_tx.send(true);
        if let Err(error) = self.join.await {
            warn!(%error, "Dispatcher poll task panicked");
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = self.in_flight.lock().map_or(0, |set| set.len());
            if remaining == 0 {
                info!("Dispatcher stopped");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    jobs.in_flight = remaining,
                    "Shutdown timeout elapsed with jobs still in flight"
                );
                return false;
            }
            sleep(DRAIN_CHECK_INTERVAL.min(timeout)).await;
        }
    }

    /// [`stop`](Self::stop) with the configured shutdown timeout.
    pub async fn stop_with_configured_timeout(self) -> bool {
        let timeout = self.shutdown_timeout;
        self.stop(timeout).await
    }

    /// Wait for the poll loop to exit on its own.
    ///
    /// Only terminates for dispatchers built with
    /// [`shutdown_when_queue_empty`](Dispatcher::shutdown_when_queue_empty)
    /// (or after [`stop`](Self::stop) was signalled elsewhere).
    pub async fn wait_for_shutdown(self) {
        if let Err(error) = self.join.await {
            warn!(%error, "Dispatcher poll task panicked");
        }
    }

    /// Number of jobs currently executing under this dispatcher.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map_or(0, |set| set.len())
    }
}

struct PollLoop<Context: Clone + Send + Sync + 'static> {
    pool: PgPool,
    context: Context,
    registry: Arc<HandlerRegistry<Context>>,
    config: DispatcherConfig,
    shutdown_when_queue_empty: bool,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<Context: Clone + Send + Sync + 'static> PollLoop<Context> {
    async fn run(mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let want = self
                .config
                .max_concurrent_jobs
                .saturating_sub(self.in_flight_len());

            if want == 0 {
                self.idle().await;
                continue;
            }

            match storage::claim_due_jobs(&self.pool, want as i64).await {
                Ok(jobs) if !jobs.is_empty() => {
                    trace!(claimed = jobs.len(), "Claimed jobs");
                    for job in jobs {
                        self.spawn_job(job);
                    }
                    // Poll again right away; the queue may hold more due work.
                }
                Ok(_) => {
                    if self.shutdown_when_queue_empty && self.queue_is_drained().await {
                        trace!("No pending jobs left. Shutting down the dispatcher…");
                        break;
                    }
                    self.idle().await;
                }
                Err(error) => {
                    // A failed claim makes this tick a no-op; the next tick
                    // retries.
                    error!(%error, "Failed to claim jobs");
                    self.idle().await;
                }
            }
        }
    }

    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().map_or(0, |set| set.len())
    }

    async fn queue_is_drained(&self) -> bool {
        if self.in_flight_len() > 0 {
            return false;
        }
        // Not-yet-due retries count as pending work.
        match storage::pending_count(&self.pool).await {
            Ok(count) => count == 0,
            Err(error) => {
                error!(%error, "Failed to count pending jobs");
                false
            }
        }
    }

    fn spawn_job(&self, job: crate::schema::Job) {
        let job_id = job.id;
        if let Ok(mut set) = self.in_flight.lock() {
            set.insert(job_id);
        }

        let pool = self.pool.clone();
        let context = self.context.clone();
        let registry = Arc::clone(&self.registry);
        let in_flight = Arc::clone(&self.in_flight);
        let timeout = self.config.job_timeout;

        tokio::spawn(async move {
            worker::run_claimed_job(&pool, context, registry, job, timeout).await;
            if let Ok(mut set) = in_flight.lock() {
                set.remove(&job_id);
            }
        });
    }

    /// Sleep one poll interval (with jitter), waking early on shutdown.
    async fn idle(&mut self) {
        let duration = sleep_duration_with_jitter(self.config.poll_interval, self.config.jitter);
        tokio::select! {
            () = sleep(duration) => {}
            _ = self.shutdown_rx.changed() => {}
        }
    }
}

fn sleep_duration_with_jitter(poll_interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return poll_interval;
    }

    let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
    poll_interval + Duration::from_millis(random_jitter)
}
