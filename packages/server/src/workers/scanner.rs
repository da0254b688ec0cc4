//! Scanner worker: recursive sitemap discovery.
//!
//! A scan is one job with one delivery per sitemap URL. The root delivery
//! claims the project's root sitemap; index sitemaps fan out one child
//! delivery per unique child URL (same job id, depth + 1). Each delivery
//! claims its URL via `Sitemap::claim_for_scan` before fetching, which
//! bounds cyclic references to one fetch per URL per scan. The job completes
//! when the last outstanding delivery drains `pending_children` to zero.
//!
//! Sub-sitemap failures are recorded and skipped; only a root failure fails
//! the job.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::common::hash::content_hash;
use crate::common::sql::Record;
use crate::domains::projects::{Project, ProjectCounters};
use crate::domains::sitemaps::{Sitemap, SitemapKind};
use crate::domains::urls::{UrlEntry, UPSERT_BATCH_SIZE};
use crate::kernel::event_bus::{LiveEvent, LogModule, StatsUpdate};
use crate::kernel::jobs::{
    publish_job_update, Job, JobContext, JobHandler, JobPayload, ScannerPayload, WorkerError,
};
use crate::kernel::metrics;
use crate::sitemap::{
    build_client, fetch_sitemap, parse_sitemap, FetchError, FetchOutcome, ParsedSitemap,
};

/// Hard cap on index recursion.
pub const MAX_DEPTH: u32 = 10;

/// Child deliveries enqueued at once.
const FANOUT_CONCURRENCY: usize = 5;

pub struct ScannerHandler {
    client: reqwest::Client,
}

impl ScannerHandler {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client()?,
        })
    }
}

#[async_trait]
impl JobHandler for ScannerHandler {
    async fn handle(&self, payload: JobPayload, ctx: Arc<JobContext>) -> Result<(), WorkerError> {
        match payload {
            JobPayload::Scanner(payload) => self.scan(payload, ctx).await,
            other => Err(WorkerError::InvalidInput(format!(
                "scanner queue received a {} payload",
                other.queue()
            ))),
        }
    }
}

impl ScannerHandler {
    async fn scan(&self, payload: ScannerPayload, ctx: Arc<JobContext>) -> Result<(), WorkerError> {
        let db = ctx.db().clone();
        let logger = ctx.logger(LogModule::Worker);
        let is_root = payload.depth == 0;

        let project = Project::find_by_id(payload.project_id, &db)
            .await
            .map_err(|_| {
                WorkerError::InvalidInput(format!("unknown project {}", payload.project_id))
            })?;
        let target_url = payload
            .sitemap_url
            .clone()
            .unwrap_or_else(|| project.root_sitemap_url.clone());

        if is_root {
            match Job::mark_processing(payload.job_id, &db).await? {
                Some(job) => {
                    publish_job_update(ctx.kernel(), ctx.organization_id, &job).await;
                    logger
                        .info(
                            format!("scan started: {target_url}"),
                            json!({"depth": payload.depth}),
                        )
                        .await;
                }
                None => {
                    // cancelled before start, or a redelivery of a finished job
                    let job = Job::find_by_id(payload.job_id, &db).await?;
                    if job.status.is_terminal() {
                        return Ok(());
                    }
                }
            }
        }

        ctx.checkpoint().await?;

        // Claim before fetching so cyclic indexes cost one fetch per URL
        let Some(claimed) = Sitemap::claim_for_scan(
            project.id,
            &target_url,
            payload.parent_sitemap_id,
            payload.job_id,
            &db,
        )
        .await?
        else {
            debug!(url = %target_url, job_id = %payload.job_id, "sitemap already visited in this scan");
            return self.finish_unit(&payload, &ctx).await;
        };

        let scan_started = Instant::now();
        let fetched = fetch_sitemap(
            &self.client,
            &target_url,
            claimed.etag.as_deref(),
            &ctx.cancellation(),
        )
        .await;

        let fetched = match fetched {
            Ok(outcome) => outcome,
            Err(FetchError::Aborted) => return Err(WorkerError::Aborted),
            Err(e) if is_root => {
                return Err(match e {
                    FetchError::Status(code) => WorkerError::InvalidInput(format!(
                        "root sitemap {target_url} returned http status {code}"
                    )),
                    other => WorkerError::Transient(format!(
                        "root sitemap {target_url} unreachable: {other}"
                    )),
                });
            }
            Err(e) => {
                logger
                    .warn(
                        format!("sub-sitemap fetch failed: {target_url}"),
                        json!({"error": e.to_string()}),
                    )
                    .await;
                return self.finish_unit(&payload, &ctx).await;
            }
        };

        let (parsed, etag) = match fetched {
            FetchOutcome::NotModified => {
                Sitemap::record_not_modified(claimed.id, &db).await?;
                logger
                    .info(format!("sitemap unchanged: {target_url}"), json!({}))
                    .await;
                return self.finish_unit(&payload, &ctx).await;
            }
            FetchOutcome::Fetched(fetched) => match parse_sitemap(&fetched.body) {
                Ok(parsed) => (parsed, fetched.etag),
                Err(e) if is_root => {
                    return Err(WorkerError::InvalidInput(e.to_string()));
                }
                Err(e) => {
                    logger
                        .warn(
                            format!("sub-sitemap parse failed: {target_url}"),
                            json!({"error": e.to_string()}),
                        )
                        .await;
                    return self.finish_unit(&payload, &ctx).await;
                }
            },
        };

        metrics::SITEMAP_SCAN_DURATION_MS.observe(scan_started.elapsed().as_millis() as f64);

        if let Some(partial) = &parsed.partial_error {
            logger
                .warn(
                    format!("sitemap parsed partially: {target_url}"),
                    json!({"error": partial}),
                )
                .await;
        }

        self.persist_sitemap(&ctx, &project, claimed.id, &parsed, etag, claimed.content_hash)
            .await?;

        self.fan_out_children(&payload, &ctx, claimed.id, &parsed, &logger)
            .await?;

        let counters = Project::update_counters(project.id, &db).await?;
        self.publish_stats(&ctx, project.id, counters).await;

        self.finish_unit(&payload, &ctx).await
    }

    /// Record the sitemap row and upsert its URL entries in batches.
    async fn persist_sitemap(
        &self,
        ctx: &Arc<JobContext>,
        project: &Project,
        sitemap_id: Uuid,
        parsed: &ParsedSitemap,
        etag: Option<String>,
        prior_hash: Option<String>,
    ) -> Result<(), WorkerError> {
        let db = ctx.db();
        let logger = ctx.logger(LogModule::Db);

        let hash = match parsed.kind {
            SitemapKind::Index => content_hash(parsed.child_sitemaps.iter().map(String::as_str)),
            _ => content_hash(parsed.urls.iter().map(|u| u.loc.as_str())),
        };
        let unchanged = prior_hash.as_deref() == Some(hash.as_str());

        Sitemap::record_fetch(
            sitemap_id,
            parsed.kind,
            parsed.urls.len() as i32,
            etag.as_deref(),
            &hash,
            db,
        )
        .await?;

        if parsed.urls.is_empty() {
            return Ok(());
        }

        metrics::URLS_DISCOVERED.inc_by(parsed.urls.len() as u64);
        ctx.add_items(parsed.urls.len() as i64, 0).await?;

        if unchanged {
            // same child set as last scan; entries are already persisted
            logger
                .info(
                    format!("url set unchanged, skipping refresh ({} urls)", parsed.urls.len()),
                    json!({"sitemapId": sitemap_id}),
                )
                .await;
            ctx.add_items(0, parsed.urls.len() as i64).await?;
            return Ok(());
        }

        let total = parsed.urls.len();
        let mut processed = 0usize;
        for batch in parsed.urls.chunks(UPSERT_BATCH_SIZE) {
            ctx.checkpoint().await?;
            UrlEntry::upsert_batch(project.id, Some(sitemap_id), batch, db).await?;
            processed += batch.len();
            ctx.add_items(0, batch.len() as i64).await?;
            ctx.report_progress(((processed * 100) / total) as i32).await?;
        }

        logger
            .info(
                format!("upserted {processed} urls"),
                json!({"sitemapId": sitemap_id}),
            )
            .await;

        Ok(())
    }

    /// Enqueue one child delivery per unique child sitemap URL.
    async fn fan_out_children(
        &self,
        payload: &ScannerPayload,
        ctx: &Arc<JobContext>,
        sitemap_id: Uuid,
        parsed: &ParsedSitemap,
        logger: &crate::kernel::event_bus::EventLogger,
    ) -> Result<(), WorkerError> {
        if parsed.kind != SitemapKind::Index || parsed.child_sitemaps.is_empty() {
            return Ok(());
        }

        if payload.depth >= MAX_DEPTH {
            logger
                .warn(
                    format!(
                        "sitemap index nesting exceeds depth {MAX_DEPTH}, not descending"
                    ),
                    json!({"sitemapId": sitemap_id}),
                )
                .await;
            return Ok(());
        }

        let mut seen = HashSet::new();
        let unique: Vec<String> = parsed
            .child_sitemaps
            .iter()
            .filter(|url| seen.insert(url.as_str()))
            .cloned()
            .collect();

        // Reserve completion slots before any child can possibly finish
        Job::add_pending_children(payload.job_id, unique.len() as i32, ctx.db()).await?;

        let queue = &ctx.kernel().queue;
        let results: Vec<anyhow::Result<Uuid>> = stream::iter(unique)
            .map(|child_url| {
                let child = JobPayload::Scanner(ScannerPayload {
                    project_id: payload.project_id,
                    job_id: payload.job_id,
                    sitemap_url: Some(child_url),
                    parent_sitemap_id: Some(sitemap_id),
                    depth: payload.depth + 1,
                });
                async move { queue.enqueue_payload(&child).await }
            })
            .buffer_unordered(FANOUT_CONCURRENCY)
            .collect()
            .await;

        for result in results {
            if let Err(e) = result {
                // the reserved slot would never drain; release it
                Job::finish_child(payload.job_id, ctx.db()).await?;
                logger
                    .error("failed to enqueue child scan", json!({"error": e.to_string()}))
                    .await;
            }
        }

        Ok(())
    }

    /// Close out this delivery and complete the job once nothing is left.
    async fn finish_unit(
        &self,
        payload: &ScannerPayload,
        ctx: &Arc<JobContext>,
    ) -> Result<(), WorkerError> {
        let db = ctx.db();

        if payload.depth == 0 {
            Project::touch_last_scan(payload.project_id, db).await?;
            self.maybe_complete(payload.job_id, ctx).await
        } else {
            let remaining = Job::finish_child(payload.job_id, db).await?;
            if remaining == 0 {
                self.maybe_complete(payload.job_id, ctx).await
            } else {
                Ok(())
            }
        }
    }

    async fn maybe_complete(&self, job_id: Uuid, ctx: &Arc<JobContext>) -> Result<(), WorkerError> {
        let db = ctx.db();
        let job = Job::find_by_id(job_id, db).await?;
        if job.status.is_terminal() || job.pending_children > 0 {
            return Ok(());
        }

        if let Some(job) = Job::complete(job_id, db).await? {
            publish_job_update(ctx.kernel(), ctx.organization_id, &job).await;
            ctx.logger(LogModule::Worker)
                .success(
                    "scan completed",
                    json!({"totalItems": job.total_items, "processedItems": job.processed_items}),
                )
                .await;
        }

        Ok(())
    }

    async fn publish_stats(&self, ctx: &Arc<JobContext>, project_id: Uuid, counters: ProjectCounters) {
        ctx.kernel()
            .event_bus
            .publish(
                ctx.organization_id,
                project_id,
                LiveEvent::StatsUpdate(StatsUpdate {
                    project_id,
                    total: counters.total,
                    indexed: counters.indexed,
                    pending: counters.pending,
                    error: counters.error,
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_cap_is_ten() {
        assert_eq!(MAX_DEPTH, 10);
    }
}
