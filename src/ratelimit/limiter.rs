//! Core rate limiter implementation.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, trace, warn};

use super::backoff::{apply_jitter, Backoff};
use super::job::{Attempt, Execution, Job, Pending};
use super::stats::{Counters, LimiterStats};
use crate::config::LimiterConfig;
use crate::error::{ExecuteError, Result};

/// Retries after a failed first attempt when none are configured.
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Base retry delay when none is configured.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);
/// Label for limiters created without a name.
const DEFAULT_NAME: &str = "default";

/// Serializes asynchronous operations, spacing their starts at least
/// `min_interval` apart and retrying failures before reporting them.
///
/// Operations run one at a time in submission order. Queue state is owned by
/// the instance; separate limiters never share state. The queue is drained by
/// a tokio task spawned on demand and stopped once the queue is empty, so an
/// idle limiter holds no task.
pub struct RateLimiter {
    shared: Arc<Shared>,
}

struct Settings {
    name: String,
    min_interval: Duration,
    max_retries: u32,
    retry_delay: Duration,
    backoff: Backoff,
    jitter: bool,
    max_queue_depth: Option<usize>,
}

struct Shared {
    settings: Settings,
    state: Mutex<QueueState>,
    counters: Counters,
    next_id: AtomicU64,
}

struct QueueState {
    queue: VecDeque<Box<dyn Job>>,
    /// When the most recent operation was dequeued
    last_execution: Option<Instant>,
    /// Whether a drain task is running
    processing: bool,
}

impl RateLimiter {
    /// Create a limiter with the default retry policy (3 retries, 1s apart).
    pub fn new(min_interval: Duration) -> Self {
        Self::with_retries(min_interval, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY)
    }

    /// Create a limiter with an explicit retry count and fixed retry delay.
    pub fn with_retries(min_interval: Duration, max_retries: u32, retry_delay: Duration) -> Self {
        Self::from_settings(Settings {
            name: DEFAULT_NAME.to_string(),
            min_interval,
            max_retries,
            retry_delay,
            backoff: Backoff::Fixed,
            jitter: false,
            max_queue_depth: None,
        })
    }

    /// Create a named limiter from configuration, rejecting invalid settings.
    pub fn from_config(name: &str, config: &LimiterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_validated(name, config))
    }

    /// Build from settings that have already passed validation.
    pub(crate) fn from_validated(name: &str, config: &LimiterConfig) -> Self {
        Self::from_settings(Settings {
            name: name.to_string(),
            min_interval: config.min_interval(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            backoff: config.backoff,
            jitter: config.jitter,
            max_queue_depth: config.max_queue_depth,
        })
    }

    fn from_settings(settings: Settings) -> Self {
        debug!(
            limiter = %settings.name,
            min_interval_ms = settings.min_interval.as_millis() as u64,
            max_retries = settings.max_retries,
            retry_delay_ms = settings.retry_delay.as_millis() as u64,
            "Creating rate limiter"
        );
        Self {
            shared: Arc::new(Shared {
                settings,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    last_execution: None,
                    processing: false,
                }),
                counters: Counters::default(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Submit an operation.
    ///
    /// The operation joins the back of the queue before this method returns,
    /// so submission order is execution order regardless of when the returned
    /// handles are awaited. The operation is called again for each retry.
    ///
    /// Never fails synchronously: rejection (full queue, no runtime) is
    /// reported through the returned [`Execution`].
    pub fn execute<F, Fut, T, E>(&self, operation: F) -> Execution<T, E>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let shared = &self.shared;
        let settings = &shared.settings;

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                shared.counters.record_rejected();
                debug!(limiter = %settings.name, "Rejecting operation, no tokio runtime");
                return Execution::rejected(ExecuteError::NoRuntime);
            }
        };

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (pending, execution) = Pending::new(id, operation);

        let start_drain = {
            let mut state = shared.state.lock();

            if let Some(max_depth) = settings.max_queue_depth {
                let depth = state.queue.len();
                if depth >= max_depth {
                    shared.counters.record_rejected();
                    debug!(
                        limiter = %settings.name,
                        job = id,
                        depth = depth,
                        "Queue full, rejecting operation"
                    );
                    return Execution::rejected(ExecuteError::QueueFull { depth });
                }
            }

            state.queue.push_back(Box::new(pending));
            shared.counters.record_submitted();
            trace!(
                limiter = %settings.name,
                job = id,
                depth = state.queue.len(),
                "Operation queued"
            );

            !std::mem::replace(&mut state.processing, true)
        };

        if start_drain {
            runtime.spawn(drain(DrainGuard::new(Arc::clone(shared))));
        }

        execution
    }

    /// Name used in log fields.
    pub fn name(&self) -> &str {
        &self.shared.settings.name
    }

    /// Minimum spacing between operation starts.
    pub fn min_interval(&self) -> Duration {
        self.shared.settings.min_interval
    }

    /// Retries after a failed first attempt.
    pub fn max_retries(&self) -> u32 {
        self.shared.settings.max_retries
    }

    /// Base delay before a retry.
    pub fn retry_delay(&self) -> Duration {
        self.shared.settings.retry_delay
    }

    /// The effective settings, in configuration form.
    pub fn config(&self) -> LimiterConfig {
        let settings = &self.shared.settings;
        LimiterConfig {
            min_interval_ms: settings.min_interval.as_millis() as u64,
            max_retries: settings.max_retries,
            retry_delay_ms: settings.retry_delay.as_millis() as u64,
            backoff: settings.backoff,
            jitter: settings.jitter,
            max_queue_depth: settings.max_queue_depth,
        }
    }

    /// Operations waiting to start. Excludes the one currently running.
    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Whether a drain task is active.
    pub fn is_processing(&self) -> bool {
        self.shared.state.lock().processing
    }

    /// Snapshot of this limiter's counters.
    pub fn stats(&self) -> LimiterStats {
        let (queued, processing) = {
            let state = self.shared.state.lock();
            (state.queue.len(), state.processing)
        };
        self.shared.counters.snapshot(queued, processing)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default().min_interval())
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settings = &self.shared.settings;
        f.debug_struct("RateLimiter")
            .field("name", &settings.name)
            .field("min_interval", &settings.min_interval)
            .field("max_retries", &settings.max_retries)
            .field("retry_delay", &settings.retry_delay)
            .field("backoff", &settings.backoff)
            .field("jitter", &settings.jitter)
            .field("max_queue_depth", &settings.max_queue_depth)
            .finish()
    }
}

impl Shared {
    /// Wait before retry number `retry` (1-based).
    fn retry_delay_for(&self, retry: u32) -> Duration {
        let settings = &self.settings;
        let delay = settings.backoff.delay(retry, settings.retry_delay);
        if settings.jitter {
            apply_jitter(delay, settings.backoff.ceiling())
        } else {
            delay
        }
    }

    /// Run the head job to completion, retrying failures, then settle it.
    async fn run(&self, mut job: Box<dyn Job>) {
        let settings = &self.settings;
        let id = job.id();

        let mut outcome = job.attempt().await;
        let mut retry = 0;
        while outcome == Attempt::Failed && retry < settings.max_retries {
            retry += 1;
            let delay = self.retry_delay_for(retry);
            self.counters.record_retry();
            debug!(
                limiter = %settings.name,
                job = id,
                retry = retry,
                delay_ms = delay.as_millis() as u64,
                "Operation failed, retrying"
            );
            sleep(delay).await;
            outcome = job.attempt().await;
        }

        match outcome {
            Attempt::Succeeded => {
                self.counters.record_completed();
                trace!(limiter = %settings.name, job = id, attempts = retry + 1, "Operation succeeded");
            }
            Attempt::Failed => {
                self.counters.record_failed();
                debug!(limiter = %settings.name, job = id, attempts = retry + 1, "Operation failed, retries exhausted");
            }
            Attempt::Panicked => {
                self.counters.record_failed();
                warn!(limiter = %settings.name, job = id, "Operation panicked");
            }
        }

        job.settle();
    }
}

/// Owned by the drain task. If the task is dropped before the queue empties
/// (runtime shutdown), clears `processing` and drops the waiting jobs so their
/// callers resolve with `Abandoned` and a later `execute` can start a new drain.
struct DrainGuard {
    shared: Arc<Shared>,
    finished: bool,
}

impl DrainGuard {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            finished: false,
        }
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let abandoned: Vec<Box<dyn Job>> = {
            let mut state = self.shared.state.lock();
            state.processing = false;
            state.queue.drain(..).collect()
        };
        for _ in &abandoned {
            self.shared.counters.record_failed();
        }
        warn!(
            limiter = %self.shared.settings.name,
            abandoned = abandoned.len(),
            "Drain task dropped before the queue emptied"
        );
        // Dropped outside the lock; each closes its caller's channel.
        drop(abandoned);
    }
}

/// Drain the queue one job at a time until it is empty.
#[instrument(skip_all, fields(limiter = %guard.shared.settings.name))]
async fn drain(mut guard: DrainGuard) {
    let shared = Arc::clone(&guard.shared);
    let min_interval = shared.settings.min_interval;
    trace!("Drain started");

    loop {
        let wait = {
            let mut state = shared.state.lock();
            if state.queue.is_empty() {
                // Cleared under the same lock that saw the empty queue, so a
                // concurrent `execute` either lands before this or starts a new drain.
                state.processing = false;
                guard.finished = true;
                break;
            }
            state
                .last_execution
                .and_then(|last| min_interval.checked_sub(last.elapsed()))
                .filter(|wait| !wait.is_zero())
        };

        if let Some(wait) = wait {
            trace!(wait_ms = wait.as_millis() as u64, "Waiting out minimum interval");
            sleep(wait).await;
        }

        let job = {
            let mut state = shared.state.lock();
            let job = state.queue.pop_front();
            if job.is_some() {
                state.last_execution = Some(Instant::now());
            }
            job
        };

        if let Some(job) = job {
            shared.run(job).await;
        }
    }

    trace!("Drain stopped");
}
