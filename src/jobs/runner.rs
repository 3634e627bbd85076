use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use rand::{Rng, RngCore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::PgClient;
use crate::shutdown_signal::{notified_shutdown_signal, shutdown_signal, ShutdownSignal};

use super::driver::{JobQueueDriver, JobQueueError, PushOptions};
use super::job::ClaimedJob;

/// Conversion of task handler return values into the worker's result type.
///
/// Lets handlers return either `()` or any `Result<(), E>` with a debuggable
/// error.
pub trait IntoJobResult {
    fn into_job_result(self) -> Result<(), String>;
}

impl IntoJobResult for () {
    fn into_job_result(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: Debug> IntoJobResult for Result<(), E> {
    fn into_job_result(self) -> Result<(), String> {
        self.map_err(|e| format!("{e:?}"))
    }
}

/// A typed job. The serialized value is the job's parameters; `NAME` selects
/// the handler on the consuming side.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail { to: String }
///
/// impl JobTask for SendEmail {
///     const NAME: &'static str = "send_email";
///
///     async fn run(self, _ctx: JobContext) -> impl IntoJobResult {
///         Ok::<(), String>(())
///     }
/// }
/// ```
pub trait JobTask: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;
    /// How many times a failing run is retried before the job is marked
    /// failed.
    const MAX_RETRIES: u16 = 4;

    fn run(self, ctx: JobContext) -> impl Future<Output = impl IntoJobResult + Send> + Send;
}

/// Context handed to every task handler invocation.
#[derive(Clone)]
pub struct JobContext {
    client: PgClient,
    job_id: Uuid,
    attempt: u16,
    worker_id: String,
}

impl JobContext {
    pub fn client(&self) -> &PgClient {
        &self.client
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Zero-based attempt counter; `0` on the first run.
    pub fn attempt(&self) -> u16 {
        self.attempt
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

/// Wire format of a job payload. The queue driver never inspects it; the
/// worker layer owns encoding, the handler lookup and the attempt counter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct JobEnvelope {
    name: String,
    attempt: u16,
    data: serde_json::Value,
}

/// Serializes `task` and pushes it on the queue.
pub async fn enqueue<T: JobTask>(
    driver: &JobQueueDriver,
    task: &T,
    options: PushOptions,
) -> Result<Uuid, JobQueueError> {
    let envelope = JobEnvelope {
        name: T::NAME.to_string(),
        attempt: 0,
        data: serde_json::to_value(task)?,
    };

    driver.push(&serde_json::to_vec(&envelope)?, options).await
}

#[derive(Error, Debug)]
enum HandlerError {
    #[error("payload did not decode: {0}")]
    Decode(serde_json::Error),
    #[error("{0}")]
    Task(String),
}

type HandlerFn = Box<
    dyn Fn(JobContext, serde_json::Value) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>
        + Send
        + Sync,
>;

struct Handler {
    max_retries: u16,
    run: HandlerFn,
}

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_BACKOFF_CAP: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_JITTER: Duration = Duration::from_millis(100);

/// Builder for [`JobRunner`].
pub struct JobRunnerOptions {
    concurrency: Option<usize>,
    handlers: HashMap<String, Handler>,
    listen_os_shutdown_signals: bool,
    shutdown_grace: Duration,
    retry_backoff_base: Duration,
    retry_backoff_cap: Duration,
    retry_jitter: Duration,
}

impl Default for JobRunnerOptions {
    fn default() -> Self {
        JobRunnerOptions {
            concurrency: None,
            handlers: HashMap::new(),
            listen_os_shutdown_signals: true,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            retry_backoff_base: DEFAULT_RETRY_BACKOFF_BASE,
            retry_backoff_cap: DEFAULT_RETRY_BACKOFF_CAP,
            retry_jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

impl JobRunnerOptions {
    /// Maximum number of jobs processed concurrently. Defaults to the number
    /// of CPUs.
    pub fn concurrency(mut self, value: usize) -> Self {
        self.concurrency = Some(value);
        self
    }

    /// Registers a task type. Claimed jobs whose envelope carries `T::NAME`
    /// are decoded into `T` and run through its handler.
    pub fn register<T: JobTask>(mut self) -> Self {
        let handler = Handler {
            max_retries: T::MAX_RETRIES,
            run: Box::new(|ctx: JobContext, data: serde_json::Value| {
                async move {
                    let task: T = serde_json::from_value(data).map_err(HandlerError::Decode)?;
                    task.run(ctx)
                        .await
                        .into_job_result()
                        .map_err(HandlerError::Task)
                }
                .boxed()
            }),
        };

        self.handlers.insert(T::NAME.to_string(), handler);
        self
    }

    /// Whether OS termination signals also trigger a graceful shutdown.
    pub fn listen_os_shutdown_signals(mut self, value: bool) -> Self {
        self.listen_os_shutdown_signals = value;
        self
    }

    /// How long in-flight handlers get to finish after shutdown before they
    /// are aborted and left for startup recovery.
    pub fn shutdown_grace(mut self, value: Duration) -> Self {
        self.shutdown_grace = value;
        self
    }

    pub fn retry_backoff_base(mut self, value: Duration) -> Self {
        self.retry_backoff_base = value;
        self
    }

    pub fn retry_backoff_cap(mut self, value: Duration) -> Self {
        self.retry_backoff_cap = value;
        self
    }

    /// Upper bound of the random jitter added to every retry delay.
    pub fn retry_jitter(mut self, value: Duration) -> Self {
        self.retry_jitter = value;
        self
    }

    pub fn build(self, driver: JobQueueDriver) -> JobRunner {
        let shutdown_notifier = Arc::new(Notify::new());
        let shutdown = if self.listen_os_shutdown_signals {
            shutdown_signal(shutdown_notifier.clone())
        } else {
            notified_shutdown_signal(shutdown_notifier.clone())
        };

        let mut random_bytes = [0u8; 9];
        rand::thread_rng().fill_bytes(&mut random_bytes);

        let (running, _) = watch::channel(false);
        JobRunner {
            worker_id: format!("hb_worker_{}", hex::encode(random_bytes)),
            concurrency: self.concurrency.unwrap_or_else(num_cpus::get),
            handlers: self.handlers,
            driver,
            shutdown_signal: shutdown,
            shutdown_notifier,
            shutdown_grace: self.shutdown_grace,
            retry_backoff_base: self.retry_backoff_base,
            retry_backoff_cap: self.retry_backoff_cap,
            retry_jitter: self.retry_jitter,
            running: Arc::new(running),
        }
    }
}

/// A pool of concurrent consumers over one [`JobQueueDriver`].
///
/// Each claimed job is decoded, dispatched to its registered handler, and
/// finalized: deleted on success, re-enqueued with exponential backoff while
/// retries remain, marked failed otherwise. Jobs interrupted by shutdown are
/// left in `processing` for the next startup's recovery policy.
pub struct JobRunner {
    worker_id: String,
    concurrency: usize,
    handlers: HashMap<String, Handler>,
    driver: JobQueueDriver,
    shutdown_signal: ShutdownSignal,
    shutdown_notifier: Arc<Notify>,
    shutdown_grace: Duration,
    retry_backoff_base: Duration,
    retry_backoff_cap: Duration,
    retry_jitter: Duration,
    running: Arc<watch::Sender<bool>>,
}

impl JobRunner {
    pub fn options() -> JobRunnerOptions {
        JobRunnerOptions::default()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn driver(&self) -> &JobQueueDriver {
        &self.driver
    }

    /// Serializes `task` and pushes it on this runner's queue.
    pub async fn enqueue<T: JobTask>(
        &self,
        task: &T,
        options: PushOptions,
    ) -> Result<Uuid, JobQueueError> {
        enqueue(&self.driver, task, options).await
    }

    /// Runs startup recovery and then consumes jobs until shutdown is
    /// requested. Returns once in-flight handlers have completed or the
    /// shutdown grace period aborted them.
    pub async fn run(&self) -> Result<(), JobQueueError> {
        self.driver.on_init().await?;

        self.running.send_replace(true);
        info!(
            worker_id = %self.worker_id,
            concurrency = self.concurrency,
            "Job runner started"
        );

        self.driver
            .job_stream(self.shutdown_signal.clone())
            .for_each_concurrent(self.concurrency, |job| self.process_job(job))
            .await;

        self.running.send_replace(false);
        info!(worker_id = %self.worker_id, "Job runner stopped");
        Ok(())
    }

    /// Requests a graceful shutdown: the claim loop ends and `run` returns
    /// after in-flight handlers complete (or the grace period expires).
    pub fn request_shutdown(&self) {
        self.shutdown_notifier.notify_one();
    }

    /// Halts the claim loop without waiting for in-flight handlers.
    pub fn stop(&self) {
        self.driver.stop();
    }

    /// Requests shutdown and waits until the runner's `run` loop has exited.
    pub async fn shutdown_gracefully(&self) {
        self.request_shutdown();
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    async fn process_job(&self, job: ClaimedJob) {
        let job_id = *job.id();

        let envelope: JobEnvelope = match serde_json::from_slice(job.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "{}", JobQueueError::DecodeJobFailed);
                self.mark_failed(job_id, &format!("{e:?}")).await;
                return;
            }
        };

        let Some(handler) = self.handlers.get(&envelope.name) else {
            error!(job_id = %job_id, job_name = %envelope.name, "{}", JobQueueError::DecodeJobFailed);
            self.mark_failed(job_id, "no handler registered for job name")
                .await;
            return;
        };

        let ctx = JobContext {
            client: self.driver.client().clone(),
            job_id,
            attempt: envelope.attempt,
            worker_id: self.worker_id.clone(),
        };

        let start = Instant::now();
        // Spawned so a panicking handler is isolated from the runner.
        let job_task = tokio::spawn((handler.run)(ctx, envelope.data.clone()));
        let abort_handle = job_task.abort_handle();

        let mut shutdown = self.shutdown_signal.clone();
        let grace = self.shutdown_grace;
        let shutdown_timeout = async move {
            (&mut shutdown).await;
            tokio::time::sleep(grace).await;
        };

        let result = tokio::select! {
            res = job_task => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(join_error) => Err(HandlerError::Task(format!("job panicked: {join_error}"))),
            },
            _ = shutdown_timeout => {
                abort_handle.abort();
                warn!(
                    job_id = %job_id,
                    job_name = %envelope.name,
                    "Job interrupted by shutdown; left processing for startup recovery"
                );
                return;
            }
        };

        match result {
            Ok(()) => {
                info!(
                    job_id = %job_id,
                    job_name = %envelope.name,
                    duration = start.elapsed().as_millis() as u64,
                    "Job completed"
                );
                if let Err(e) = self.driver.finished(job_id).await {
                    error!(job_id = %job_id, error = ?e, "Could not finalize job");
                }
            }
            Err(HandlerError::Decode(e)) => {
                error!(job_id = %job_id, job_name = %envelope.name, error = %e, "{}", JobQueueError::DecodeJobFailed);
                self.mark_failed(job_id, &format!("{e:?}")).await;
            }
            Err(HandlerError::Task(message)) => {
                if envelope.attempt < handler.max_retries {
                    let delay = retry_delay(
                        self.retry_backoff_base,
                        self.retry_backoff_cap,
                        self.retry_jitter,
                        envelope.attempt,
                    );
                    warn!(
                        job_id = %job_id,
                        job_name = %envelope.name,
                        attempt = envelope.attempt,
                        retry_in = ?delay,
                        error = %message,
                        "Job failed; retrying"
                    );
                    self.requeue_with_attempt(job_id, envelope, delay).await;
                } else {
                    error!(
                        job_id = %job_id,
                        job_name = %envelope.name,
                        attempts = envelope.attempt + 1,
                        error = %message,
                        "Job max retries reached"
                    );
                    self.mark_failed(job_id, &message).await;
                }
            }
        }
    }

    async fn requeue_with_attempt(&self, job_id: Uuid, envelope: JobEnvelope, delay: Duration) {
        let retry = JobEnvelope {
            attempt: envelope.attempt + 1,
            ..envelope
        };

        match serde_json::to_vec(&retry) {
            Ok(payload) => {
                let delayed_until = PushOptions::delayed_by(delay).delayed_until;
                if let Err(e) = self.driver.requeue(job_id, &payload, delayed_until).await {
                    error!(job_id = %job_id, error = ?e, "Could not requeue job");
                }
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Could not serialize retry payload");
                self.mark_failed(job_id, &format!("{e:?}")).await;
            }
        }
    }

    async fn mark_failed(&self, job_id: Uuid, message: &str) {
        if let Err(e) = self.driver.failed(job_id, message).await {
            error!(job_id = %job_id, error = ?e, "Could not mark job failed");
        }
    }
}

/// Exponential backoff bounded by `cap`, plus a uniform random jitter.
fn retry_delay(base: Duration, cap: Duration, jitter: Duration, attempt: u16) -> Duration {
    let exponent = u32::from(attempt).min(16);
    let backoff = base.saturating_mul(2u32.saturating_pow(exponent)).min(cap);

    if jitter.is_zero() {
        return backoff;
    }

    let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_millis))
}
