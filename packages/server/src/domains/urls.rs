//! URL store: idempotent persistence of discovered URL entries.
//!
//! Entries are keyed by `(project_id, loc_hash)` where the hash is SHA-256 of
//! the loc. Re-upserting an entry refreshes its sitemap linkage and metadata
//! but never disturbs `first_seen_at` or submission state.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::hash::sha256_hex;
use crate::sitemap::SitemapUrl;

/// Maximum rows per upsert statement.
pub const UPSERT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "url_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrlStatus {
    #[default]
    Discovered,
    Queued,
    Submitted,
    Indexed,
    #[sqlx(rename = "error_4xx")]
    #[serde(rename = "ERROR_4XX")]
    Error4xx,
    #[sqlx(rename = "error_5xx")]
    #[serde(rename = "ERROR_5XX")]
    Error5xx,
    CrawlError,
}

#[derive(FromRow, Debug, Clone)]
pub struct UrlEntry {
    pub id: Uuid,
    pub project_id: Uuid,
    pub sitemap_id: Option<Uuid>,
    pub loc: String,
    pub loc_hash: String,
    pub lastmod: Option<DateTime<Utc>>,
    pub changefreq: Option<String>,
    pub priority: Option<f32>,
    pub google_status: UrlStatus,
    pub bing_status: UrlStatus,
    pub google_submitted_at: Option<DateTime<Utc>>,
    pub google_last_checked_at: Option<DateTime<Utc>>,
    pub bing_submitted_at: Option<DateTime<Utc>>,
    pub bing_last_checked_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

/// Just enough of a URL row to submit it.
#[derive(FromRow, Debug, Clone)]
pub struct UrlRef {
    pub id: Uuid,
    pub loc: String,
}

impl UrlEntry {
    /// Bulk upsert of parsed entries, chunked at 500 rows per statement.
    ///
    /// Duplicate locs within the input collapse to one row. Returns the
    /// number of entries written.
    pub async fn upsert_batch(
        project_id: Uuid,
        sitemap_id: Option<Uuid>,
        entries: &[SitemapUrl],
        db: &PgPool,
    ) -> Result<u64> {
        let mut written = 0u64;

        for chunk in entries.chunks(UPSERT_BATCH_SIZE) {
            // dedupe within the statement: one row per loc_hash
            let mut seen = std::collections::HashSet::new();
            let mut ids: Vec<Uuid> = Vec::with_capacity(chunk.len());
            let mut locs: Vec<&str> = Vec::with_capacity(chunk.len());
            let mut hashes: Vec<String> = Vec::with_capacity(chunk.len());
            let mut lastmods: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(chunk.len());
            let mut changefreqs: Vec<Option<&str>> = Vec::with_capacity(chunk.len());
            let mut priorities: Vec<Option<f32>> = Vec::with_capacity(chunk.len());

            for entry in chunk {
                let hash = sha256_hex(&entry.loc);
                if !seen.insert(hash.clone()) {
                    continue;
                }
                ids.push(Uuid::new_v4());
                locs.push(entry.loc.as_str());
                hashes.push(hash);
                lastmods.push(entry.lastmod);
                changefreqs.push(entry.changefreq.as_deref());
                priorities.push(entry.priority);
            }

            if ids.is_empty() {
                continue;
            }

            let result = sqlx::query(
                r#"
                INSERT INTO urls (id, project_id, sitemap_id, loc, loc_hash, lastmod, changefreq, priority)
                SELECT id, $1, $2, loc, loc_hash, lastmod, changefreq, priority
                FROM UNNEST(
                    $3::uuid[], $4::text[], $5::text[], $6::timestamptz[], $7::text[], $8::real[]
                ) AS t(id, loc, loc_hash, lastmod, changefreq, priority)
                ON CONFLICT (project_id, loc_hash) DO UPDATE SET
                    sitemap_id = EXCLUDED.sitemap_id,
                    lastmod = EXCLUDED.lastmod,
                    changefreq = EXCLUDED.changefreq,
                    priority = EXCLUDED.priority
                "#,
            )
            .bind(project_id)
            .bind(sitemap_id)
            .bind(&ids)
            .bind(&locs)
            .bind(&hashes)
            .bind(&lastmods)
            .bind(&changefreqs)
            .bind(&priorities)
            .execute(db)
            .await?;

            written += result.rows_affected();
        }

        Ok(written)
    }

    /// Resolve `{id, loc}` pairs for submission, preserving input order.
    pub async fn list_by_ids(url_ids: &[Uuid], db: &PgPool) -> Result<Vec<UrlRef>> {
        let refs = sqlx::query_as::<_, UrlRef>(
            r#"
            SELECT u.id, u.loc
            FROM UNNEST($1::uuid[]) WITH ORDINALITY AS t(id, ord)
            JOIN urls u ON u.id = t.id
            ORDER BY t.ord
            "#,
        )
        .bind(url_ids)
        .fetch_all(db)
        .await?;

        Ok(refs)
    }

    /// Stamp a Google submission outcome on one URL.
    pub async fn set_google_status(url_id: Uuid, status: UrlStatus, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE urls
            SET google_status = $2,
                google_submitted_at = CASE WHEN $2 = 'submitted'::url_status
                                           THEN NOW() ELSE google_submitted_at END,
                google_last_checked_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(url_id)
        .bind(status)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Stamp an IndexNow (bing) submission on a set of URLs.
    pub async fn set_bing_submitted(url_ids: &[Uuid], db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE urls
            SET bing_status = 'submitted',
                bing_submitted_at = NOW(),
                bing_last_checked_at = NOW()
            WHERE id = ANY($1)
            "#,
        )
        .bind(url_ids)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn find_by_loc(project_id: Uuid, loc: &str, db: &PgPool) -> Result<Option<Self>> {
        let entry = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project_id, sitemap_id, loc, loc_hash, lastmod, changefreq, priority,
                   google_status, bing_status, google_submitted_at, google_last_checked_at,
                   bing_submitted_at, bing_last_checked_at, first_seen_at, removed_at
            FROM urls
            WHERE project_id = $1 AND loc_hash = $2
            "#,
        )
        .bind(project_id)
        .bind(sha256_hex(loc))
        .fetch_optional(db)
        .await?;

        Ok(entry)
    }

    pub async fn count_for_project(project_id: Uuid, db: &PgPool) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM urls WHERE project_id = $1")
            .bind(project_id)
            .fetch_one(db)
            .await?;

        Ok(count)
    }
}
