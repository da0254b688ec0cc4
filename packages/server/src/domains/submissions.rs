//! Submission log: append-only record of per-URL, per-engine attempts.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Attempts recorded per submission row before giving up.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "search_engine", rename_all = "snake_case")]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Google,
    Indexnow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "submission_action", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionAction {
    UrlUpdated,
    UrlDeleted,
}

impl SubmissionAction {
    /// Wire value for the Google Indexing API `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionAction::UrlUpdated => "URL_UPDATED",
            SubmissionAction::UrlDeleted => "URL_DELETED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "submission_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Submission {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub url_id: Uuid,
    pub project_id: Uuid,
    pub engine: Engine,
    #[builder(default = SubmissionAction::UrlUpdated)]
    pub action: SubmissionAction,
    #[builder(default)]
    pub status: SubmissionStatus,
    #[builder(default = 1)]
    pub attempts: i32,
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,
    #[builder(default, setter(strip_option))]
    pub response_code: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default = Utc::now())]
    pub scheduled_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Submission {
    /// Append one attempt record. Rows are never updated afterwards.
    pub async fn append(&self, db: &PgPool) -> Result<Self> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO submissions (
                id, url_id, project_id, engine, action, status, attempts, max_attempts,
                response_code, error_message, scheduled_at, started_at, completed_at, next_retry_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id, url_id, project_id, engine, action, status, attempts, max_attempts,
                      response_code, error_message, scheduled_at, started_at, completed_at,
                      next_retry_at
            "#,
        )
        .bind(self.id)
        .bind(self.url_id)
        .bind(self.project_id)
        .bind(self.engine)
        .bind(self.action)
        .bind(self.status)
        .bind(self.attempts)
        .bind(self.max_attempts)
        .bind(self.response_code)
        .bind(&self.error_message)
        .bind(self.scheduled_at)
        .bind(self.started_at)
        .bind(self.completed_at)
        .bind(self.next_retry_at)
        .fetch_one(db)
        .await?;

        Ok(row)
    }

    pub async fn list_for_url(url_id: Uuid, db: &PgPool) -> Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, url_id, project_id, engine, action, status, attempts, max_attempts,
                   response_code, error_message, scheduled_at, started_at, completed_at,
                   next_retry_at
            FROM submissions
            WHERE url_id = $1
            ORDER BY scheduled_at
            "#,
        )
        .bind(url_id)
        .fetch_all(db)
        .await?;

        Ok(rows)
    }

    pub async fn count_for_project(project_id: Uuid, engine: Engine, db: &PgPool) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM submissions WHERE project_id = $1 AND engine = $2",
        )
        .bind(project_id)
        .bind(engine)
        .fetch_one(db)
        .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_wire_values_match_google_contract() {
        assert_eq!(SubmissionAction::UrlUpdated.as_str(), "URL_UPDATED");
        assert_eq!(SubmissionAction::UrlDeleted.as_str(), "URL_DELETED");
    }

    #[test]
    fn builder_defaults() {
        let row = Submission::builder()
            .url_id(Uuid::new_v4())
            .project_id(Uuid::new_v4())
            .engine(Engine::Google)
            .build();

        assert_eq!(row.status, SubmissionStatus::Pending);
        assert_eq!(row.max_attempts, 3);
        assert_eq!(row.attempts, 1);
    }
}
