use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{stream, FutureExt, Stream};
use indoc::indoc;
use sqlx::{query, query_scalar, PgConnection};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::client::PgClient;
use crate::migrations::{MigrationError, Migrations};
use crate::shutdown_signal::ShutdownSignal;

use super::job::{ClaimedJob, JobStatus};
use super::migrations::JOB_QUEUE_MIGRATIONS;

/// Startup policy for jobs left over from a previous process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCleanup {
    /// Leave the rows untouched.
    DoNothing,
    /// Insert a fresh queue entry for every matching job.
    Rerun,
    /// Delete the matching job rows.
    Remove,
}

/// Configuration for [`JobQueueDriver`].
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Applied to `pending` jobs on startup.
    pub pending_jobs_initialization: JobCleanup,
    /// Applied to `failed` jobs on startup.
    pub failed_jobs_initialization: JobCleanup,
    /// Applied to `processing` jobs on startup. These are jobs a previous
    /// process claimed but never finalized.
    pub processing_jobs_initialization: JobCleanup,
    /// How long the claim stream sleeps when the queue is empty.
    pub poll_time: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        JobQueueConfig {
            pending_jobs_initialization: JobCleanup::DoNothing,
            failed_jobs_initialization: JobCleanup::Rerun,
            processing_jobs_initialization: JobCleanup::Rerun,
            poll_time: Duration::from_millis(100),
        }
    }
}

/// Options for [`JobQueueDriver::push`].
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Earliest instant the job may be claimed. `None` means immediately.
    pub delayed_until: Option<DateTime<Utc>>,
}

impl PushOptions {
    pub fn delayed_until(instant: DateTime<Utc>) -> Self {
        PushOptions {
            delayed_until: Some(instant),
        }
    }

    pub fn delayed_by(delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let instant = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        PushOptions {
            delayed_until: Some(instant),
        }
    }
}

/// Errors raised by the job queue.
#[derive(Error, Debug)]
pub enum JobQueueError {
    /// The payload could not be decoded or no handler matched its name.
    #[error("failed to decode job payload into a registered job type")]
    DecodeJobFailed,

    /// The queue entry could not be inserted, typically because the job is
    /// already enqueued.
    #[error("failed to add job to the queue")]
    FailedToAdd,

    /// The migration run this driver depends on failed.
    #[error("migrations failed before the job queue could start: {0}")]
    MigrationFailed(Arc<MigrationError>),

    #[error("Error occured while serializing job payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Error occured while query: {0}")]
    Sql(#[from] sqlx::Error),
}

impl From<Arc<MigrationError>> for JobQueueError {
    fn from(e: Arc<MigrationError>) -> Self {
        JobQueueError::MigrationFailed(e)
    }
}

const CLAIM_SQL: &str = indoc! {r#"
    DELETE FROM _hb_pg_job_queue
    WHERE job_id = (
        SELECT job_id FROM _hb_pg_job_queue
            WHERE delayed_until IS NULL OR delayed_until <= now()
            ORDER BY createdAt ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
    )
    RETURNING job_id
"#};

/// Durable job queue driver over `_hb_pg_jobs` and `_hb_pg_job_queue`.
///
/// `push` writes the job row and its queue entry in one transaction;
/// `claim_next` removes a queue entry and flips the job to `processing`
/// atomically with respect to concurrent workers. Worker exclusion relies
/// entirely on `FOR UPDATE SKIP LOCKED` row locking; there are no
/// application-level locks.
///
/// Construction registers the queue's migrations (group `_hb_jobqueue`) with
/// the shared engine; every operation waits for the engine to complete before
/// touching the database.
#[derive(Clone)]
pub struct JobQueueDriver {
    client: PgClient,
    migrations: Arc<Migrations>,
    config: JobQueueConfig,
    stopped: Arc<watch::Sender<bool>>,
}

impl JobQueueDriver {
    pub fn new(client: PgClient, migrations: Arc<Migrations>, config: JobQueueConfig) -> Self {
        for migration in JOB_QUEUE_MIGRATIONS {
            migrations.add(migration.clone());
        }

        let (stopped, _) = watch::channel(false);
        JobQueueDriver {
            client,
            migrations,
            config,
            stopped: Arc::new(stopped),
        }
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    pub fn client(&self) -> &PgClient {
        &self.client
    }

    /// Applies the configured startup policies to jobs left over from a
    /// previous process. Call once before consuming jobs.
    pub async fn on_init(&self) -> Result<(), JobQueueError> {
        self.migrations.wait_until_completed().await?;

        let config = self.config.clone();
        self.client
            .with_connection::<_, JobQueueError, _>(move |conn| {
                async move {
                    let policies = [
                        (JobStatus::Pending, config.pending_jobs_initialization),
                        (JobStatus::Processing, config.processing_jobs_initialization),
                        (JobStatus::Failed, config.failed_jobs_initialization),
                    ];
                    for (status, policy) in policies {
                        apply_cleanup(&mut *conn, status, policy).await?;
                    }
                    Ok(())
                }
                .boxed()
            })
            .await
    }

    /// Enqueues an opaque payload. The job row and its queue entry are
    /// written in one transaction; on failure neither exists.
    pub async fn push(&self, payload: &[u8], options: PushOptions) -> Result<Uuid, JobQueueError> {
        self.migrations.wait_until_completed().await?;

        let job_id = Uuid::new_v4();
        let payload = payload.to_vec();
        self.client
            .with_transaction::<_, JobQueueError, _>(move |conn| {
                async move {
                    query("INSERT INTO _hb_pg_jobs (id, job, status) VALUES ($1, $2, $3)")
                        .bind(job_id)
                        .bind(&payload)
                        .bind(JobStatus::Pending)
                        .execute(&mut *conn)
                        .await?;

                    enqueue_entry(conn, job_id, options.delayed_until).await
                }
                .boxed()
            })
            .await?;

        debug!(job_id = %job_id, "Job pushed");
        Ok(job_id)
    }

    /// Claims the oldest eligible job, or returns `None` when the queue has
    /// no work.
    ///
    /// Within one transaction: the oldest non-delayed queue entry is deleted
    /// (`FOR UPDATE SKIP LOCKED` keeps concurrent claims disjoint), the job
    /// row is locked, and its status is flipped to `processing`. A queue
    /// entry whose job row has vanished is dropped and the claim retried.
    pub async fn claim_next(&self) -> Result<Option<ClaimedJob>, JobQueueError> {
        self.migrations.wait_until_completed().await?;

        loop {
            let mut tx = self.client.begin().await?;

            let claimed: Option<Uuid> = query_scalar(CLAIM_SQL).fetch_optional(tx.as_mut()).await?;
            let Some(job_id) = claimed else {
                tx.rollback().await?;
                return Ok(None);
            };

            let payload: Option<Option<Vec<u8>>> =
                query_scalar("SELECT job FROM _hb_pg_jobs WHERE id = $1 FOR UPDATE SKIP LOCKED")
                    .bind(job_id)
                    .fetch_optional(tx.as_mut())
                    .await?;

            let Some(payload) = payload else {
                // The entry referenced a job row that no longer exists. Keep
                // the entry deletion and claim again.
                tx.commit().await?;
                debug!(job_id = %job_id, "Dropped orphaned queue entry");
                continue;
            };

            query("UPDATE _hb_pg_jobs SET status = $2, lastModified = now() WHERE id = $1")
                .bind(job_id)
                .bind(JobStatus::Processing)
                .execute(tx.as_mut())
                .await?;

            tx.commit().await?;
            debug!(job_id = %job_id, "Job claimed");
            return Ok(Some(ClaimedJob::new(job_id, payload.unwrap_or_default())));
        }
    }

    /// Finalizes a successfully processed job by deleting its row.
    pub async fn finished(&self, job_id: Uuid) -> Result<(), JobQueueError> {
        query("DELETE FROM _hb_pg_jobs WHERE id = $1")
            .bind(job_id)
            .execute(self.client.pool())
            .await?;

        debug!(job_id = %job_id, "Job finished");
        Ok(())
    }

    /// Marks a job as permanently failed.
    pub async fn failed(&self, job_id: Uuid, error: &str) -> Result<(), JobQueueError> {
        query("UPDATE _hb_pg_jobs SET status = $2, lastModified = now() WHERE id = $1")
            .bind(job_id)
            .bind(JobStatus::Failed)
            .execute(self.client.pool())
            .await?;

        error!(job_id = %job_id, error, "Job failed");
        Ok(())
    }

    /// Puts a claimed job back on the queue with a replacement payload,
    /// optionally delayed. Used by the worker retry path.
    pub async fn requeue(
        &self,
        job_id: Uuid,
        payload: &[u8],
        delayed_until: Option<DateTime<Utc>>,
    ) -> Result<(), JobQueueError> {
        let payload = payload.to_vec();
        self.client
            .with_transaction::<_, JobQueueError, _>(move |conn| {
                async move {
                    query(
                        "UPDATE _hb_pg_jobs SET job = $2, status = $3, lastModified = now() WHERE id = $1",
                    )
                    .bind(job_id)
                    .bind(&payload)
                    .bind(JobStatus::Pending)
                    .execute(&mut *conn)
                    .await?;

                    enqueue_entry(conn, job_id, delayed_until).await
                }
                .boxed()
            })
            .await?;

        debug!(job_id = %job_id, "Job requeued");
        Ok(())
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, JobQueueError> {
        self.migrations.wait_until_completed().await?;

        let value: Option<Option<Vec<u8>>> =
            query_scalar("SELECT value FROM _hb_pg_job_queue_metadata WHERE key = $1")
                .bind(key)
                .fetch_optional(self.client.pool())
                .await?;

        Ok(value.flatten())
    }

    pub async fn set_metadata(&self, key: &str, value: &[u8]) -> Result<(), JobQueueError> {
        self.migrations.wait_until_completed().await?;

        query(indoc! {r#"
            INSERT INTO _hb_pg_job_queue_metadata (key, value)
                VALUES ($1, $2)
                ON CONFLICT (key) DO UPDATE SET value = excluded.value
        "#})
        .bind(key)
        .bind(value)
        .execute(self.client.pool())
        .await?;

        Ok(())
    }

    /// Diagnostic listing of job ids with the given status. Rows locked by
    /// in-flight claims are skipped.
    pub async fn get_jobs(&self, status: JobStatus) -> Result<Vec<Uuid>, JobQueueError> {
        self.migrations.wait_until_completed().await?;

        let ids = query_scalar("SELECT id FROM _hb_pg_jobs WHERE status = $1 FOR UPDATE SKIP LOCKED")
            .bind(status)
            .fetch_all(self.client.pool())
            .await?;

        Ok(ids)
    }

    /// Permanently stops every stream created by [`JobQueueDriver::job_stream`].
    pub fn stop(&self) {
        self.stopped.send_replace(true);
        info!("Job queue driver stopped");
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// A lazy, cancellable stream of claimed jobs. Sleeps `poll_time` between
    /// claims while the queue is empty, and ends once [`JobQueueDriver::stop`]
    /// is called or `shutdown` resolves. Claim errors are logged and retried
    /// on the next poll.
    pub fn job_stream(&self, shutdown: ShutdownSignal) -> impl Stream<Item = ClaimedJob> + 'static {
        let driver = self.clone();
        stream::unfold((driver, shutdown), |(driver, shutdown)| async move {
            loop {
                if driver.is_stopped() {
                    return None;
                }

                let claim = async {
                    match driver.claim_next().await {
                        Ok(job) => job,
                        Err(e) => {
                            error!(error = ?e, "Could not claim job");
                            None
                        }
                    }
                };
                let job = tokio::select! {
                    job = claim => job,
                    _ = shutdown.clone() => return None,
                };

                if let Some(job) = job {
                    return Some((job, (driver, shutdown)));
                }

                let mut stop_rx = driver.stopped.subscribe();
                tokio::select! {
                    _ = tokio::time::sleep(driver.config.poll_time) => {}
                    _ = stop_rx.wait_for(|stopped| *stopped) => return None,
                    _ = shutdown.clone() => return None,
                }
            }
        })
    }
}

async fn enqueue_entry(
    conn: &mut PgConnection,
    job_id: Uuid,
    delayed_until: Option<DateTime<Utc>>,
) -> Result<(), JobQueueError> {
    let done = query(indoc! {r#"
        INSERT INTO _hb_pg_job_queue (job_id, createdAt, delayed_until)
            VALUES ($1, now(), $2)
            ON CONFLICT (job_id) DO NOTHING
    "#})
    .bind(job_id)
    .bind(delayed_until)
    .execute(&mut *conn)
    .await?;

    if done.rows_affected() == 0 {
        return Err(JobQueueError::FailedToAdd);
    }
    Ok(())
}

async fn apply_cleanup(
    conn: &mut PgConnection,
    status: JobStatus,
    policy: JobCleanup,
) -> Result<(), JobQueueError> {
    match policy {
        JobCleanup::DoNothing => {}
        JobCleanup::Remove => {
            let done = query("DELETE FROM _hb_pg_jobs WHERE status = $1")
                .bind(status)
                .execute(&mut *conn)
                .await?;

            if done.rows_affected() > 0 {
                info!(status = ?status, removed = done.rows_affected(), "Removed leftover jobs");
            }
        }
        JobCleanup::Rerun => {
            // Pending jobs are already enqueued.
            if matches!(status, JobStatus::Pending) {
                return Ok(());
            }

            let done = query(indoc! {r#"
                INSERT INTO _hb_pg_job_queue (job_id, createdAt)
                    SELECT id, now() FROM _hb_pg_jobs WHERE status = $1
                    ON CONFLICT (job_id) DO NOTHING
            "#})
            .bind(status)
            .execute(&mut *conn)
            .await?;

            if done.rows_affected() > 0 {
                info!(status = ?status, requeued = done.rows_affected(), "Re-enqueued leftover jobs");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_reruns_everything_but_pending() {
        let config = JobQueueConfig::default();
        assert_eq!(config.pending_jobs_initialization, JobCleanup::DoNothing);
        assert_eq!(config.failed_jobs_initialization, JobCleanup::Rerun);
        assert_eq!(config.processing_jobs_initialization, JobCleanup::Rerun);
        assert_eq!(config.poll_time, Duration::from_millis(100));
    }

    #[test]
    fn delayed_by_produces_a_future_instant() {
        let options = PushOptions::delayed_by(Duration::from_secs(5));
        assert!(options.delayed_until.unwrap() > Utc::now());
    }
}
