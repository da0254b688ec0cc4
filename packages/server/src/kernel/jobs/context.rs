//! Per-job execution context handed to worker handlers.
//!
//! Carries the cancellation token, throttled progress reporting, and the
//! pause/abort checkpoint that long-running loops call between units of work
//! (a sitemap, a batch, a URL).

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::kernel::event_bus::{EventLogger, JobUpdate, LiveEvent, LogModule};
use crate::kernel::jobs::job::Job;
use crate::kernel::metrics;
use crate::kernel::server_kernel::ServerKernel;
use crate::kernel::vault::VaultError;

/// Maximum wait between pause-flag polls.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Progress updates are persisted/published at most this often.
pub const PROGRESS_PUBLISH_INTERVAL: Duration = Duration::from_millis(200);

/// Worker error taxonomy. Classified once at the failure site; the worker
/// loop and the broker act on the classification without re-inspecting.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Network timeouts, 5xx, rate limits without quota semantics. Retried
    /// locally first, then surfaced to the broker for delayed redelivery.
    #[error("{0}")]
    Transient(String),
    /// Quota exhausted, permission denied, invalid credential. The job fails
    /// immediately and the broker does not redeliver.
    #[error("{0}")]
    FatalPerJob(String),
    /// Malformed sitemap or unreachable root.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Cooperative abort; surfaces as Job CANCELLED.
    #[error("Job Aborted")]
    Aborted,
}

impl WorkerError {
    pub fn retryable(&self) -> bool {
        matches!(self, WorkerError::Transient(_))
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            WorkerError::Transient(_) => "transient",
            WorkerError::FatalPerJob(_) => "fatal_per_job",
            WorkerError::InvalidInput(_) => "invalid_input",
            WorkerError::Aborted => "aborted",
        }
    }
}

impl From<sqlx::Error> for WorkerError {
    fn from(e: sqlx::Error) -> Self {
        WorkerError::Transient(format!("database error: {e}"))
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(e: anyhow::Error) -> Self {
        WorkerError::Transient(format!("{e:#}"))
    }
}

impl From<VaultError> for WorkerError {
    fn from(e: VaultError) -> Self {
        WorkerError::FatalPerJob(e.to_string())
    }
}

struct ProgressState {
    last_value: i32,
    last_published: Option<Instant>,
}

/// Execution context for one job delivery.
pub struct JobContext {
    kernel: Arc<ServerKernel>,
    pub job_id: Uuid,
    pub project_id: Uuid,
    pub organization_id: Uuid,
    cancel: CancellationToken,
    progress: Mutex<ProgressState>,
}

impl JobContext {
    /// Resolve the owning organization and build a context for a delivery.
    pub async fn load(
        kernel: Arc<ServerKernel>,
        job_id: Uuid,
        project_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, WorkerError> {
        let organization_id: Option<Uuid> =
            sqlx::query_scalar("SELECT organization_id FROM projects WHERE id = $1")
                .bind(project_id)
                .fetch_optional(&kernel.db_pool)
                .await?;

        let organization_id = organization_id
            .ok_or_else(|| WorkerError::InvalidInput(format!("unknown project {project_id}")))?;

        Ok(Arc::new(Self {
            kernel,
            job_id,
            project_id,
            organization_id,
            cancel,
            progress: Mutex::new(ProgressState {
                last_value: 0,
                last_published: None,
            }),
        }))
    }

    pub fn kernel(&self) -> &Arc<ServerKernel> {
        &self.kernel
    }

    pub fn db(&self) -> &sqlx::PgPool {
        &self.kernel.db_pool
    }

    /// Token propagated into HTTP and parse work so an abort interrupts
    /// in-flight operations.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn logger(&self, module: LogModule) -> EventLogger {
        EventLogger::new(
            self.kernel.event_bus.clone(),
            self.organization_id,
            self.project_id,
            Some(self.job_id),
            module,
        )
    }

    /// Pause/abort checkpoint. Call between units of work.
    ///
    /// Reads the job's control flags, blocking while paused (≤500 ms
    /// granularity) and returning `Aborted` once cancellation is requested
    /// so no further unit starts after an abort.
    pub async fn checkpoint(&self) -> Result<(), WorkerError> {
        if self.cancel.is_cancelled() {
            return Err(WorkerError::Aborted);
        }

        let mut was_paused = false;
        loop {
            let (paused, cancelled) = Job::control_flags(self.job_id, self.db()).await?;
            if cancelled {
                self.cancel.cancel();
                return Err(WorkerError::Aborted);
            }
            if !paused {
                if was_paused {
                    debug!(job_id = %self.job_id, "job resumed");
                }
                return Ok(());
            }
            if !was_paused {
                debug!(job_id = %self.job_id, "job paused, waiting");
                was_paused = true;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(WorkerError::Aborted),
                _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Report progress as a percentage.
    ///
    /// The effective value is clamped to `[last reported, 100]` and persisted
    /// and published at most once per 200 ms; 100 always goes through.
    pub async fn report_progress(&self, percent: i32) -> Result<(), WorkerError> {
        let clamped = {
            let mut progress = self.progress.lock().await;
            let clamped = percent.clamp(progress.last_value, 100);
            if clamped == progress.last_value && progress.last_published.is_some() {
                return Ok(());
            }

            let now = Instant::now();
            if let Some(at) = progress.last_published {
                if now.duration_since(at) < PROGRESS_PUBLISH_INTERVAL && clamped < 100 {
                    // remember the value; the next eligible report carries it
                    progress.last_value = clamped;
                    return Ok(());
                }
            }
            progress.last_value = clamped;
            progress.last_published = Some(now);
            clamped
        };

        if let Some(job) = Job::set_progress(self.job_id, clamped, self.db()).await? {
            publish_job_update(&self.kernel, self.organization_id, &job).await;
        }
        Ok(())
    }

    /// Accumulate total/processed item counters.
    pub async fn add_items(&self, total_delta: i64, processed_delta: i64) -> Result<(), WorkerError> {
        Job::add_items(self.job_id, total_delta, processed_delta, self.db()).await?;
        Ok(())
    }
}

impl From<&Job> for JobUpdate {
    fn from(job: &Job) -> Self {
        JobUpdate {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            progress: job.progress,
            processed_items: job.processed_items,
            total_items: job.total_items,
        }
    }
}

/// Publish a JOB_UPDATE for the current job row; records throughput and
/// duration metrics when the row is terminal.
pub async fn publish_job_update(kernel: &ServerKernel, organization_id: Uuid, job: &Job) {
    if job.status.is_terminal() {
        metrics::JOBS
            .with_label_values(&[job.job_type.as_label()])
            .inc();
        if let (Some(started), Some(completed)) = (job.started_at, job.completed_at) {
            let elapsed_ms = (completed - started).num_milliseconds().max(0) as f64;
            metrics::JOB_DURATION_MS
                .with_label_values(&[job.job_type.as_label()])
                .observe(elapsed_ms);
        }
    }

    kernel
        .event_bus
        .publish(
            organization_id,
            job.project_id,
            LiveEvent::JobUpdate(job.into()),
        )
        .await;
}
