//! PostgreSQL-backed queue broker.
//!
//! Durable named queues with at-least-once delivery: deliveries are claimed
//! with `FOR UPDATE SKIP LOCKED`, leased, and recovered when a lease expires.
//! Failed deliveries are redelivered with exponential backoff until
//! `max_attempts`, then parked as dead.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::job::{Job, JobType};
use super::payload::JobPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "queue_job_status", rename_all = "snake_case")]
pub enum QueueJobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Dead,
}

/// One delivery on a queue.
#[derive(FromRow, Debug, Clone)]
pub struct QueueJob {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: QueueJobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueJob {
    /// Deserialize the delivery payload.
    pub fn parse_payload(&self) -> Result<JobPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// What became of a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Requeued for delayed redelivery.
    Retried,
    /// Non-retryable; parked as failed.
    Failed,
    /// Retries exhausted; parked as dead.
    Dead,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The project already has a live scan of this flavor.
    #[error("a {0:?} job is already pending or processing for this project")]
    Conflict(JobType),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

const QUEUE_JOB_COLUMNS: &str = "id, queue, payload, status, attempts, max_attempts, run_at, \
     lease_expires_at, worker_id, created_at, updated_at";

/// PostgreSQL-backed queue broker.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    default_lease_ms: i64,
}

impl PostgresQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_lease_ms: 60_000,
        }
    }

    pub fn with_lease_duration(pool: PgPool, lease_ms: i64) -> Self {
        Self {
            pool,
            default_lease_ms: lease_ms,
        }
    }

    /// Create a job record and its first delivery.
    ///
    /// Scan-type jobs are rejected with `Conflict` while the project has a
    /// live scan; the partial unique index on `jobs` backstops the check
    /// under races.
    pub async fn enqueue_job(&self, job: &Job, payload: &JobPayload) -> Result<Job, EnqueueError> {
        if job.job_type.is_scan() && Job::has_active_scan(job.project_id, &self.pool).await? {
            return Err(EnqueueError::Conflict(job.job_type));
        }

        let inserted = job
            .insert(&self.pool)
            .await
            .map_err(|e| match e.downcast_ref::<sqlx::Error>() {
                Some(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                    EnqueueError::Conflict(job.job_type)
                }
                _ => EnqueueError::Other(e),
            })?;

        self.enqueue_payload(payload).await?;

        info!(job_id = %inserted.id, queue = payload.queue(), "job enqueued");
        Ok(inserted)
    }

    /// Enqueue a delivery for immediate pickup.
    pub async fn enqueue_payload(&self, payload: &JobPayload) -> Result<Uuid> {
        self.enqueue_payload_at(payload, Utc::now()).await
    }

    /// Enqueue a delivery for delayed pickup.
    pub async fn enqueue_payload_at(
        &self,
        payload: &JobPayload,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO queue_jobs (id, queue, payload, run_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(payload.queue())
        .bind(serde_json::to_value(payload)?)
        .bind(run_at)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Claim up to `limit` ready deliveries on a queue.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` for concurrent-safe claiming and also
    /// recovers deliveries whose lease expired (worker died mid-flight).
    pub async fn claim(&self, queue: &str, worker_id: &str, limit: i64) -> Result<Vec<QueueJob>> {
        let jobs = sqlx::query_as::<_, QueueJob>(&format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM queue_jobs
                WHERE queue = $1
                  AND (
                    (status = 'queued' AND run_at <= NOW())
                    OR (status = 'running' AND lease_expires_at < NOW())
                  )
                ORDER BY run_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs
            SET status = 'running',
                attempts = attempts + 1,
                lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                worker_id = $4,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {QUEUE_JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(self.default_lease_ms.to_string())
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    pub async fn mark_completed(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'completed', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Park or requeue a failed delivery.
    pub async fn mark_failed(&self, delivery: &QueueJob, retryable: bool) -> Result<FailureDisposition> {
        if retryable && delivery.attempts < delivery.max_attempts {
            // Delayed redelivery with exponential backoff, capped at an hour
            let delay_secs = 2i64.pow(delivery.attempts as u32).min(3_600);
            let retry_at = Utc::now() + chrono::Duration::seconds(delay_secs);

            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET status = 'queued',
                    run_at = $2,
                    lease_expires_at = NULL,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(delivery.id)
            .bind(retry_at)
            .execute(&self.pool)
            .await?;

            return Ok(FailureDisposition::Retried);
        }

        let terminal = if retryable {
            QueueJobStatus::Dead
        } else {
            QueueJobStatus::Failed
        };
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(terminal)
        .execute(&self.pool)
        .await?;

        Ok(if retryable {
            FailureDisposition::Dead
        } else {
            FailureDisposition::Failed
        })
    }

    /// Extend the lease for a running delivery (heartbeat).
    pub async fn heartbeat(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET lease_expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(self.default_lease_ms.to_string())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Queued deliveries on a queue (gauges and tests).
    pub async fn depth(&self, queue: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue = $1 AND status = 'queued'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles() {
        // mirrors the delay computation in mark_failed
        let delays: Vec<i64> = (1..=4).map(|a| 2i64.pow(a as u32).min(3_600)).collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
    }

    #[test]
    fn backoff_is_capped_at_an_hour() {
        assert_eq!(2i64.pow(20).min(3_600), 3_600);
    }
}
