//! IndexNow submitter.
//!
//! One delivery posts the whole URL batch to every participating endpoint in
//! parallel (capped at four in flight). A 422 or 429 on a batch larger than
//! ten URLs splits it in half after a one-second pause and recurses; smaller
//! 429s retry with backoff, smaller 422s count as rejected. A URL is
//! considered submitted when at least one endpoint accepted a batch
//! containing it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::{stream, FutureExt, StreamExt};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::common::sql::Record;
use crate::domains::credentials::Credential;
use crate::domains::projects::Project;
use crate::domains::quota::QuotaUsage;
use crate::domains::submissions::{Engine, Submission, SubmissionAction, SubmissionStatus};
use crate::domains::urls::UrlEntry;
use crate::kernel::event_bus::LogModule;
use crate::kernel::jobs::{
    publish_job_update, IndexNowPayload, Job, JobContext, JobHandler, JobPayload, WorkerError,
};
use crate::kernel::metrics;

/// Participating endpoints, hit in parallel for every batch.
pub const INDEXNOW_ENDPOINTS: [(&str, &str); 5] = [
    ("bing", "https://www.bing.com/indexnow"),
    ("yandex", "https://yandex.com/indexnow"),
    ("seznam", "https://search.seznam.cz/indexnow"),
    ("naver", "https://searchadvisor.naver.com/indexnow"),
    ("indexnow", "https://api.indexnow.org/indexnow"),
];

/// Endpoints in flight at once.
const ENDPOINT_CONCURRENCY: usize = 4;

/// Batches at or below this size stop splitting.
const MIN_SPLIT_SIZE: usize = 10;

/// Per-endpoint retries on 5xx/network errors and small-batch 429s.
const MAX_ENDPOINT_RETRIES: u32 = 3;

/// Per-endpoint request deadline.
const ENDPOINT_DEADLINE: Duration = Duration::from_secs(30);

/// Nominal daily IndexNow allowance recorded in quota rows.
const INDEXNOW_DAILY_LIMIT: i64 = 10_000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexNowBody<'a> {
    host: &'a str,
    key: &'a str,
    key_location: &'a str,
    url_list: &'a [String],
}

pub struct IndexNowSubmitHandler {
    client: reqwest::Client,
    endpoints: Vec<(String, String)>,
}

impl IndexNowSubmitHandler {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_endpoints(
            INDEXNOW_ENDPOINTS
                .iter()
                .map(|(name, url)| (name.to_string(), url.to_string()))
                .collect(),
        )
    }

    /// Endpoint override used by tests.
    pub fn with_endpoints(endpoints: Vec<(String, String)>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ENDPOINT_DEADLINE)
            .build()?;
        Ok(Self { client, endpoints })
    }
}

#[async_trait]
impl JobHandler for IndexNowSubmitHandler {
    async fn handle(&self, payload: JobPayload, ctx: Arc<JobContext>) -> Result<(), WorkerError> {
        match payload {
            JobPayload::IndexNow(payload) => self.submit(payload, ctx).await,
            other => Err(WorkerError::InvalidInput(format!(
                "indexnow queue received a {} payload",
                other.queue()
            ))),
        }
    }
}

impl IndexNowSubmitHandler {
    async fn submit(
        &self,
        payload: IndexNowPayload,
        ctx: Arc<JobContext>,
    ) -> Result<(), WorkerError> {
        let db = ctx.db().clone();
        let logger = ctx.logger(LogModule::Worker);

        if let Some(job) = Job::mark_processing(payload.job_id, &db).await? {
            publish_job_update(ctx.kernel(), ctx.organization_id, &job).await;
        }
        ctx.checkpoint().await?;

        let project = Project::find_by_id(payload.project_id, &db)
            .await
            .map_err(|_| {
                WorkerError::InvalidInput(format!("unknown project {}", payload.project_id))
            })?;

        let credential = Credential::find_for_engine(payload.project_id, Engine::Indexnow, &db)
            .await?
            .ok_or_else(|| {
                WorkerError::FatalPerJob(
                    "InvalidCredential: no IndexNow key configured".into(),
                )
            })?;

        let url_refs = UrlEntry::list_by_ids(&payload.url_ids, &db).await?;
        if url_refs.is_empty() {
            if let Some(job) = Job::complete(payload.job_id, &db).await? {
                publish_job_update(ctx.kernel(), ctx.organization_id, &job).await;
            }
            return Ok(());
        }
        ctx.add_items(url_refs.len() as i64, 0).await?;

        let locs: Vec<String> = url_refs.iter().map(|u| u.loc.clone()).collect();

        // Key plaintext stays inside this block
        let accepted = {
            let key = ctx.kernel().vault.decrypt(&credential.sealed())?;
            let key_location = format!("https://{}/{}.txt", project.domain, key.as_str());

            let cancel = ctx.cancellation();
            let results: Vec<HashSet<usize>> = stream::iter(self.endpoints.clone())
                .map(|(name, endpoint)| {
                    let locs = &locs;
                    let key = key.as_str();
                    let key_location = key_location.as_str();
                    let domain = project.domain.as_str();
                    let cancel = &cancel;
                    async move {
                        let accepted = self
                            .submit_slice(&endpoint, domain, key, key_location, locs, 0, cancel)
                            .await;
                        tracing::debug!(
                            endpoint = %name,
                            accepted = accepted.len(),
                            total = locs.len(),
                            "indexnow endpoint done"
                        );
                        accepted
                    }
                })
                .buffer_unordered(ENDPOINT_CONCURRENCY)
                .collect()
                .await;

            let mut accepted: HashSet<usize> = HashSet::new();
            for endpoint_accepted in results {
                accepted.extend(endpoint_accepted);
            }
            accepted
        };
        Credential::touch_last_used(credential.id, &db).await?;

        if ctx.cancellation().is_cancelled() {
            return Err(WorkerError::Aborted);
        }

        let mut submitted_ids: Vec<uuid::Uuid> = Vec::new();
        let mut errors = 0usize;
        let total = url_refs.len();

        for (index, url_ref) in url_refs.iter().enumerate() {
            let ok = accepted.contains(&index);
            Submission::builder()
                .url_id(url_ref.id)
                .project_id(payload.project_id)
                .engine(Engine::Indexnow)
                .action(SubmissionAction::UrlUpdated)
                .status(if ok {
                    SubmissionStatus::Completed
                } else {
                    SubmissionStatus::Failed
                })
                .response_code(if ok { 200 } else { 0 })
                .started_at(Utc::now())
                .completed_at(Utc::now())
                .build()
                .append(&db)
                .await?;

            if ok {
                submitted_ids.push(url_ref.id);
            } else {
                errors += 1;
            }

            ctx.add_items(0, 1).await?;
            ctx.report_progress((((index + 1) * 100) / total) as i32).await?;
        }

        if !submitted_ids.is_empty() {
            UrlEntry::set_bing_submitted(&submitted_ids, &db).await?;
            Project::touch_last_submission(payload.project_id, &db).await?;
        }
        metrics::INDEXNOW_SUBMISSIONS
            .with_label_values(&["success"])
            .inc_by(submitted_ids.len() as u64);
        metrics::INDEXNOW_SUBMISSIONS
            .with_label_values(&["failed"])
            .inc_by(errors as u64);

        QuotaUsage::increment(
            payload.project_id,
            Engine::Indexnow,
            total as i64,
            INDEXNOW_DAILY_LIMIT,
            &db,
        )
        .await?;

        if errors == total {
            return Err(WorkerError::FatalPerJob(
                "all IndexNow endpoints rejected the batch".into(),
            ));
        }

        if let Some(job) = Job::complete(payload.job_id, &db).await? {
            publish_job_update(ctx.kernel(), ctx.organization_id, &job).await;
        }
        logger
            .success(
                format!("indexnow submission finished: {}/{total} accepted", submitted_ids.len()),
                json!({"submitted": submitted_ids.len(), "errors": errors}),
            )
            .await;

        Ok(())
    }

    /// Submit `locs[offset..]`'s slice to one endpoint, splitting adaptively.
    ///
    /// Returns the set of absolute indices the endpoint accepted.
    #[allow(clippy::too_many_arguments)]
    fn submit_slice<'a>(
        &'a self,
        endpoint: &'a str,
        host: &'a str,
        key: &'a str,
        key_location: &'a str,
        locs: &'a [String],
        offset: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, HashSet<usize>> {
        async move {
            let mut retries = 0u32;

            loop {
                if cancel.is_cancelled() {
                    return HashSet::new();
                }

                let body = IndexNowBody {
                    host,
                    key,
                    key_location,
                    url_list: locs,
                };
                let payload = match serde_json::to_vec(&body) {
                    Ok(payload) => payload,
                    Err(_) => return HashSet::new(),
                };

                let started = Instant::now();
                let request = self
                    .client
                    .post(endpoint)
                    .header(CONTENT_TYPE, "application/json; charset=utf-8")
                    .body(payload)
                    .send();

                let response = tokio::select! {
                    _ = cancel.cancelled() => return HashSet::new(),
                    r = request => r,
                };
                metrics::API_LATENCY_MS
                    .with_label_values(&["indexnow"])
                    .observe(started.elapsed().as_millis() as f64);

                let status = match response {
                    Ok(response) => response.status(),
                    Err(e) => {
                        if retries >= MAX_ENDPOINT_RETRIES {
                            tracing::warn!(endpoint, error = %e, "indexnow endpoint unreachable");
                            return HashSet::new();
                        }
                        retries += 1;
                        let backoff = Duration::from_secs(1) * 2u32.pow(retries - 1);
                        tokio::select! {
                            _ = cancel.cancelled() => return HashSet::new(),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        continue;
                    }
                };

                match status.as_u16() {
                    200 | 202 => {
                        return (offset..offset + locs.len()).collect();
                    }
                    422 | 429 if locs.len() > MIN_SPLIT_SIZE => {
                        // the batch is the problem; halve and try again
                        tokio::select! {
                            _ = cancel.cancelled() => return HashSet::new(),
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        let mid = locs.len() / 2;
                        let (left, right) = locs.split_at(mid);
                        let mut accepted = self
                            .submit_slice(endpoint, host, key, key_location, left, offset, cancel)
                            .await;
                        accepted.extend(
                            self.submit_slice(
                                endpoint,
                                host,
                                key,
                                key_location,
                                right,
                                offset + mid,
                                cancel,
                            )
                            .await,
                        );
                        return accepted;
                    }
                    429 => {
                        if retries >= MAX_ENDPOINT_RETRIES {
                            tracing::warn!(endpoint, "indexnow rate limit persisted");
                            return HashSet::new();
                        }
                        retries += 1;
                        let backoff = Duration::from_secs(1) * 2u32.pow(retries - 1);
                        tokio::select! {
                            _ = cancel.cancelled() => return HashSet::new(),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                    422 => {
                        tracing::warn!(endpoint, batch = locs.len(), "indexnow rejected batch");
                        return HashSet::new();
                    }
                    400 | 403 => {
                        // invalid request or key: no point retrying this endpoint
                        tracing::warn!(endpoint, status = status.as_u16(), "indexnow fatal response");
                        return HashSet::new();
                    }
                    code if (500..600).contains(&code) => {
                        if retries >= MAX_ENDPOINT_RETRIES {
                            tracing::warn!(endpoint, code, "indexnow endpoint erroring");
                            return HashSet::new();
                        }
                        retries += 1;
                        let backoff = Duration::from_secs(1) * 2u32.pow(retries - 1);
                        tokio::select! {
                            _ = cancel.cancelled() => return HashSet::new(),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                    code => {
                        tracing::warn!(endpoint, code, "unexpected indexnow response");
                        return HashSet::new();
                    }
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_table_covers_the_protocol() {
        let names: Vec<&str> = INDEXNOW_ENDPOINTS.iter().map(|(n, _)| *n).collect();
        assert!(names.contains(&"bing"));
        assert!(names.contains(&"yandex"));
        assert!(names.contains(&"seznam"));
        assert!(names.contains(&"naver"));
    }

    #[test]
    fn batches_of_ten_or_fewer_never_split() {
        assert_eq!(MIN_SPLIT_SIZE, 10);
    }

    #[test]
    fn body_serializes_with_camel_case_keys() {
        let urls = vec!["https://example.com/a".to_string()];
        let body = IndexNowBody {
            host: "example.com",
            key: "0123456789abcdef0123456789abcdef",
            key_location: "https://example.com/0123456789abcdef0123456789abcdef.txt",
            url_list: &urls,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["host"], "example.com");
        assert!(json.get("keyLocation").is_some());
        assert!(json.get("urlList").is_some());
    }
}
