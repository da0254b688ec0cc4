//! Job model: the user-visible unit of work.
//!
//! A job row tracks one scan or submission from PENDING through a terminal
//! state, with monotonic progress and the bookkeeping the scanner's fan-out
//! needs (`pending_children`). Queue deliveries live in `queue_jobs` and are
//! a broker concern; several scanner deliveries can share one job.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    FullScan,
    IncrementalSync,
    GoogleSubmission,
    IndexnowSubmission,
    StatusCheck,
}

impl JobType {
    /// Scan flavors are mutually exclusive per project while active.
    pub fn is_scan(&self) -> bool {
        matches!(self, JobType::FullScan | JobType::IncrementalSync)
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            JobType::FullScan => "full_scan",
            JobType::IncrementalSync => "incremental_sync",
            JobType::GoogleSubmission => "google_submission",
            JobType::IndexnowSubmission => "indexnow_submission",
            JobType::StatusCheck => "status_check",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are final; no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

// ============================================================================
// Job Model
// ============================================================================

const JOB_COLUMNS: &str = "id, project_id, job_type, status, progress, total_items, \
     processed_items, pending_children, pause_requested, cancel_requested, metadata, \
     error_message, scheduled_at, started_at, completed_at, created_at, updated_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub project_id: Uuid,
    pub job_type: JobType,

    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub progress: i32,
    #[builder(default = 0)]
    pub total_items: i64,
    #[builder(default = 0)]
    pub processed_items: i64,
    #[builder(default = 0)]
    pub pending_children: i32,
    #[builder(default = false)]
    pub pause_requested: bool,
    #[builder(default = false)]
    pub cancel_requested: bool,

    #[builder(default = serde_json::Value::Object(serde_json::Map::new()))]
    pub metadata: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    #[builder(default = Utc::now())]
    pub scheduled_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create an immediate job (convenience constructor)
    pub fn immediate(project_id: Uuid, job_type: JobType) -> Self {
        Self::builder()
            .project_id(project_id)
            .job_type(job_type)
            .build()
    }

    pub async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(job)
    }

    pub async fn insert(&self, db: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO jobs (
                id, project_id, job_type, status, progress, total_items, processed_items,
                pending_children, pause_requested, cancel_requested, metadata, error_message,
                scheduled_at, started_at, completed_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(self.project_id)
        .bind(self.job_type)
        .bind(self.status)
        .bind(self.progress)
        .bind(self.total_items)
        .bind(self.processed_items)
        .bind(self.pending_children)
        .bind(self.pause_requested)
        .bind(self.cancel_requested)
        .bind(&self.metadata)
        .bind(&self.error_message)
        .bind(self.scheduled_at)
        .bind(self.started_at)
        .bind(self.completed_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(job)
    }

    /// PENDING → PROCESSING. Returns None if the job was not pending
    /// (already started, or cancelled before start).
    pub async fn mark_processing(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// PROCESSING → COMPLETED with progress pinned to 100.
    pub async fn complete(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE jobs
            SET status = 'completed',
                progress = 100,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// Any non-terminal state → FAILED.
    pub async fn fail(id: Uuid, message: &str, db: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error_message = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(message)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// Any non-terminal state → CANCELLED.
    pub async fn cancel(id: Uuid, message: &str, db: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                error_message = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(message)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// Monotonic progress: the stored value never moves backwards.
    pub async fn set_progress(id: Uuid, percent: i32, db: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE jobs
            SET progress = LEAST(100, GREATEST(progress, $2)),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(percent)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// Accumulate item counters (atomic; called per batch).
    pub async fn add_items(
        id: Uuid,
        total_delta: i64,
        processed_delta: i64,
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE jobs
            SET total_items = total_items + $2,
                processed_items = processed_items + $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(total_delta)
        .bind(processed_delta)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// Reserve fan-out slots before child deliveries are enqueued.
    pub async fn add_pending_children(id: Uuid, count: i32, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET pending_children = pending_children + $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(count)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Atomically release one fan-out slot; returns the remaining count.
    pub async fn finish_child(id: Uuid, db: &PgPool) -> Result<i32> {
        let remaining: i32 = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET pending_children = GREATEST(pending_children - 1, 0),
                updated_at = NOW()
            WHERE id = $1
            RETURNING pending_children
            "#,
        )
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(remaining)
    }

    /// Current pause/abort flags, polled by worker checkpoints.
    pub async fn control_flags(id: Uuid, db: &PgPool) -> Result<(bool, bool)> {
        let flags: (bool, bool) = sqlx::query_as(
            "SELECT pause_requested, cancel_requested FROM jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(flags)
    }

    pub async fn set_pause_requested(id: Uuid, paused: bool, db: &PgPool) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET pause_requested = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .bind(paused)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    pub async fn set_cancel_requested(id: Uuid, db: &PgPool) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET cancel_requested = TRUE, updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    /// Whether the project already has a live scan of any flavor.
    pub async fn has_active_scan(project_id: Uuid, db: &PgPool) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE project_id = $1
              AND job_type IN ('full_scan', 'incremental_sync')
              AND status IN ('pending', 'processing')
            "#,
        )
        .bind(project_id)
        .fetch_one(db)
        .await?;

        Ok(count > 0)
    }
}
