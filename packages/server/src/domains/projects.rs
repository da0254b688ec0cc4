//! Project model and cached URL counters.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::sql::Record;

const PROJECT_COLUMNS: &str = "id, organization_id, domain, root_sitemap_url, settings, \
     total_urls, indexed_urls, pending_urls, error_urls, last_scan_at, last_submission_at, \
     created_at, updated_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Project {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub organization_id: Uuid,
    pub domain: String,
    pub root_sitemap_url: String,
    #[builder(default = serde_json::Value::Object(serde_json::Map::new()))]
    pub settings: serde_json::Value,
    #[builder(default = 0)]
    pub total_urls: i64,
    #[builder(default = 0)]
    pub indexed_urls: i64,
    #[builder(default = 0)]
    pub pending_urls: i64,
    #[builder(default = 0)]
    pub error_urls: i64,
    #[builder(default, setter(strip_option))]
    pub last_scan_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_submission_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// Aggregated URL counts for a project, keyed off `google_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectCounters {
    pub total: i64,
    pub indexed: i64,
    pub pending: i64,
    pub error: i64,
}

impl Project {
    /// Recompute and persist the cached counters in one transaction.
    ///
    /// The cache is eventually consistent with the underlying rows; readers
    /// must not assume freshness.
    pub async fn update_counters(project_id: Uuid, db: &PgPool) -> Result<ProjectCounters> {
        let mut tx = db.begin().await?;

        let (total, indexed, pending, error): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE google_status = 'indexed'),
                COUNT(*) FILTER (WHERE google_status IN ('discovered', 'queued', 'submitted')),
                COUNT(*) FILTER (WHERE google_status IN ('error_4xx', 'error_5xx', 'crawl_error'))
            FROM urls
            WHERE project_id = $1 AND removed_at IS NULL
            "#,
        )
        .bind(project_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE projects
            SET total_urls = $2,
                indexed_urls = $3,
                pending_urls = $4,
                error_urls = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(project_id)
        .bind(total)
        .bind(indexed)
        .bind(pending)
        .bind(error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ProjectCounters {
            total,
            indexed,
            pending,
            error,
        })
    }

    pub async fn touch_last_scan(project_id: Uuid, db: &PgPool) -> Result<()> {
        sqlx::query("UPDATE projects SET last_scan_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(project_id)
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn touch_last_submission(project_id: Uuid, db: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE projects SET last_submission_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(project_id)
        .execute(db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Record for Project {
    const TABLE: &'static str = "projects";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self> {
        let project = sqlx::query_as::<_, Self>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(project)
    }

    async fn insert(&self, db: &PgPool) -> Result<Self> {
        let project = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO projects (
                id, organization_id, domain, root_sitemap_url, settings,
                total_urls, indexed_urls, pending_urls, error_urls,
                last_scan_at, last_submission_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {PROJECT_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(self.organization_id)
        .bind(&self.domain)
        .bind(&self.root_sitemap_url)
        .bind(&self.settings)
        .bind(self.total_urls)
        .bind(self.indexed_urls)
        .bind(self.pending_urls)
        .bind(self.error_urls)
        .bind(self.last_scan_at)
        .bind(self.last_submission_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(project)
    }
}
