//! Per-day, per-engine quota bookkeeping.
//!
//! `used` only ever grows, and only through the atomic UPSERT below, so
//! concurrent submitters add up correctly.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::submissions::Engine;

#[derive(FromRow, Debug, Clone)]
pub struct QuotaUsage {
    pub project_id: Uuid,
    pub engine: Engine,
    pub date: NaiveDate,
    pub used: i64,
    pub quota_limit: i64,
}

impl QuotaUsage {
    /// Quota days roll over at midnight UTC.
    pub fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    pub async fn find(
        project_id: Uuid,
        engine: Engine,
        date: NaiveDate,
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT project_id, engine, date, used, quota_limit
            FROM quota_usage
            WHERE project_id = $1 AND engine = $2 AND date = $3
            "#,
        )
        .bind(project_id)
        .bind(engine)
        .bind(date)
        .fetch_optional(db)
        .await?;

        Ok(row)
    }

    /// Units consumed today; zero when no row exists yet.
    pub async fn used_today(project_id: Uuid, engine: Engine, db: &PgPool) -> Result<i64> {
        Ok(Self::find(project_id, engine, Self::today(), db)
            .await?
            .map(|row| row.used)
            .unwrap_or(0))
    }

    /// Atomically add `delta` to today's usage, creating the row on first
    /// use. Returns the new total.
    pub async fn increment(
        project_id: Uuid,
        engine: Engine,
        delta: i64,
        limit: i64,
        db: &PgPool,
    ) -> Result<i64> {
        let used: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO quota_usage (project_id, engine, date, used, quota_limit)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (project_id, engine, date) DO UPDATE SET
                used = quota_usage.used + EXCLUDED.used
            RETURNING used
            "#,
        )
        .bind(project_id)
        .bind(engine)
        .bind(Self::today())
        .bind(delta)
        .bind(limit)
        .fetch_one(db)
        .await?;

        Ok(used)
    }
}
