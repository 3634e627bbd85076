//! Postgres-backed building blocks for long-running services: a schema
//! migration engine, a key-value persist store with TTLs, and a durable job
//! queue with a concurrent worker pool.
//!
//! The three subsystems share one [`Migrations`] engine. The persist and job
//! queue drivers register their own schema under dedicated migration groups
//! and wait for the engine to complete before serving traffic:
//!
//! ```ignore
//! let client = PgClient::connect(&database_url, 20).await?;
//! let migrations = Arc::new(Migrations::new());
//!
//! let persist = PersistDriver::new(client.clone(), migrations.clone());
//! let driver = JobQueueDriver::new(client.clone(), migrations.clone(), Default::default());
//!
//! migrations.apply(&client, &[], false).await?;
//!
//! let runner = JobRunner::options()
//!     .concurrency(4)
//!     .register::<SendEmail>()
//!     .build(driver);
//! runner.run().await?;
//! ```

pub mod client;
pub mod jobs;
pub mod migrations;
pub mod persist;
pub mod shutdown_signal;

pub use client::PgClient;
pub use jobs::{
    enqueue, ClaimedJob, IntoJobResult, JobCleanup, JobContext, JobQueueConfig, JobQueueDriver,
    JobQueueError, JobRunner, JobRunnerOptions, JobStatus, JobTask, PushOptions,
};
pub use migrations::{
    AppliedMigration, Migration, MigrationError, MigrationGroup, Migrations, SqlMigration,
};
pub use persist::{PersistDriver, PersistError};
pub use shutdown_signal::ShutdownSignal;
