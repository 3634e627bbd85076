//! Durable job queue with at-least-once delivery.
//!
//! Producers push opaque payloads through [`JobQueueDriver`]; a [`JobRunner`]
//! hosts a pool of workers that claim jobs with `FOR UPDATE SKIP LOCKED`
//! semantics, dispatch them to typed [`JobTask`] handlers, and retry with
//! exponential backoff. Crash recovery is governed by the per-status
//! [`JobCleanup`] policies applied at startup.

mod driver;
mod job;
mod migrations;
mod runner;

pub use driver::{JobCleanup, JobQueueConfig, JobQueueDriver, JobQueueError, PushOptions};
pub use job::{ClaimedJob, JobStatus};
pub use runner::{enqueue, IntoJobResult, JobContext, JobRunner, JobRunnerOptions, JobTask};
