//! Sitemap records: one row per `(project, url)`, forming the discovered
//! sitemap tree.
//!
//! The `last_scan_job_id` column doubles as the scan-cycle dedupe: a scan
//! claims a sitemap URL exactly once per job via an atomic conditional
//! upsert, which is what keeps mutually-referencing indexes from looping.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sitemap_kind", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SitemapKind {
    Index,
    Urlset,
    Rss,
}

#[derive(FromRow, Debug, Clone)]
pub struct Sitemap {
    pub id: Uuid,
    pub project_id: Uuid,
    pub url: String,
    pub kind: SitemapKind,
    pub parent_id: Option<Uuid>,
    pub url_count: i32,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub last_scan_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of claiming a sitemap URL for a scan: the row id plus the cached
/// validators from the previous fetch.
#[derive(FromRow, Debug, Clone)]
pub struct ClaimedSitemap {
    pub id: Uuid,
    pub etag: Option<String>,
    pub content_hash: Option<String>,
}

impl Sitemap {
    /// Claim a sitemap URL for one scan run, before fetching it.
    ///
    /// Inserts the row on first sighting (kind is provisional until the
    /// fetch records the real one) or stamps `last_scan_job_id` on an
    /// existing row. Returns None when this scan already claimed the URL,
    /// which is the cycle/duplicate guard: the caller skips the fetch
    /// entirely.
    pub async fn claim_for_scan(
        project_id: Uuid,
        url: &str,
        parent_id: Option<Uuid>,
        scan_job_id: Uuid,
        db: &PgPool,
    ) -> Result<Option<ClaimedSitemap>> {
        let claimed = sqlx::query_as::<_, ClaimedSitemap>(
            r#"
            INSERT INTO sitemaps (id, project_id, url, kind, parent_id, last_scan_job_id)
            VALUES ($1, $2, $3, 'urlset', $4, $5)
            ON CONFLICT (project_id, url) DO UPDATE SET
                last_scan_job_id = EXCLUDED.last_scan_job_id,
                parent_id = COALESCE(sitemaps.parent_id, EXCLUDED.parent_id),
                updated_at = NOW()
            WHERE sitemaps.last_scan_job_id IS DISTINCT FROM EXCLUDED.last_scan_job_id
            RETURNING id, etag, content_hash
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(url)
        .bind(parent_id)
        .bind(scan_job_id)
        .fetch_optional(db)
        .await?;

        Ok(claimed)
    }

    /// Record the outcome of a fetch-and-parse on a claimed row.
    pub async fn record_fetch(
        id: Uuid,
        kind: SitemapKind,
        url_count: i32,
        etag: Option<&str>,
        content_hash: &str,
        db: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sitemaps
            SET kind = $2,
                url_count = $3,
                etag = $4,
                content_hash = $5,
                last_fetched_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(kind)
        .bind(url_count)
        .bind(etag)
        .bind(content_hash)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Refresh validators on a 304 without touching the parsed state.
    pub async fn record_not_modified(id: Uuid, db: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE sitemaps SET last_fetched_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self> {
        let sitemap = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project_id, url, kind, parent_id, url_count, etag, last_modified,
                   last_fetched_at, content_hash, last_scan_job_id, created_at, updated_at
            FROM sitemaps
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(sitemap)
    }

    pub async fn count_for_project(project_id: Uuid, db: &PgPool) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sitemaps WHERE project_id = $1")
            .bind(project_id)
            .fetch_one(db)
            .await?;

        Ok(count)
    }
}
