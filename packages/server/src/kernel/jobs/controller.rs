//! Job controller: pause, resume, abort.
//!
//! Pause and abort are flags on the job row; workers observe them at their
//! next checkpoint (≤500 ms). Aborting a job that has not started yet has no
//! worker to observe the flag, so it is cancelled directly.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use uuid::Uuid;

use super::context::publish_job_update;
use super::job::{Job, JobStatus};
use crate::kernel::server_kernel::ServerKernel;

#[derive(Clone)]
pub struct JobController {
    kernel: Arc<ServerKernel>,
}

impl JobController {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self { kernel }
    }

    /// Request a pause. Returns false if the job is already terminal.
    pub async fn pause(&self, job_id: Uuid) -> Result<bool> {
        let flagged = Job::set_pause_requested(job_id, true, &self.kernel.db_pool).await?;
        if flagged {
            info!(job_id = %job_id, "pause requested");
        }
        Ok(flagged)
    }

    /// Clear a pause request.
    pub async fn resume(&self, job_id: Uuid) -> Result<bool> {
        let flagged = Job::set_pause_requested(job_id, false, &self.kernel.db_pool).await?;
        if flagged {
            info!(job_id = %job_id, "resume requested");
        }
        Ok(flagged)
    }

    /// Request an abort. Running workers translate the flag into a CANCELLED
    /// transition at their next checkpoint; pending jobs are cancelled here.
    pub async fn abort(&self, job_id: Uuid) -> Result<bool> {
        let flagged = Job::set_cancel_requested(job_id, &self.kernel.db_pool).await?;
        if !flagged {
            return Ok(false);
        }
        info!(job_id = %job_id, "abort requested");

        let job = Job::find_by_id(job_id, &self.kernel.db_pool).await?;
        if job.status == JobStatus::Pending {
            if let Some(cancelled) = Job::cancel(job_id, "Job Aborted", &self.kernel.db_pool).await?
            {
                let organization_id: Uuid =
                    sqlx::query_scalar("SELECT organization_id FROM projects WHERE id = $1")
                        .bind(cancelled.project_id)
                        .fetch_one(&self.kernel.db_pool)
                        .await?;
                publish_job_update(&self.kernel, organization_id, &cancelled).await;
            }
        }

        Ok(true)
    }
}
