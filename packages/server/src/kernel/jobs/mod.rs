//! Job infrastructure: the job model, the queue broker, and the worker loop.
//!
//! ```text
//! API / scheduler
//!     │ enqueue_job(Job, JobPayload)
//!     ▼
//! PostgresQueue ── queue_jobs table (FOR UPDATE SKIP LOCKED claims)
//!     │
//! QueueWorker (per queue: concurrency cap + rate limit)
//!     ├─► JobHandler::handle(payload, JobContext)
//!     │       ├─ checkpoint() — pause/abort flags
//!     │       └─ report_progress() — clamped, throttled
//!     └─► classify result → complete / redeliver / fail / cancel
//! ```

mod context;
mod controller;
mod job;
mod payload;
mod queue;
mod worker;

pub use context::{
    publish_job_update, JobContext, WorkerError, PAUSE_POLL_INTERVAL, PROGRESS_PUBLISH_INTERVAL,
};
pub use controller::JobController;
pub use job::{Job, JobStatus, JobType};
pub use payload::{
    GooglePayload, IndexNowPayload, JobPayload, ScannerPayload, QUEUE_GOOGLE, QUEUE_INDEXNOW,
    QUEUE_NAMES, QUEUE_SCANNER,
};
pub use queue::{EnqueueError, FailureDisposition, PostgresQueue, QueueJob, QueueJobStatus};
pub use worker::{JobHandler, QueueWorker, QueueWorkerConfig};
