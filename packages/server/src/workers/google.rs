//! Google Indexing API submitter.
//!
//! One delivery submits a set of URL ids sequentially under the project's
//! daily quota: decrypt the service account, exchange a signed RS256 JWT for
//! a bearer token, then publish one notification per URL with at least one
//! second between requests. Permission and quota rejections kill the job on
//! the spot; other 4xx are per-URL errors; 5xx and network errors retry per
//! URL up to three times.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::domains::credentials::Credential;
use crate::domains::projects::Project;
use crate::domains::quota::QuotaUsage;
use crate::domains::submissions::{Engine, Submission, SubmissionStatus};
use crate::domains::urls::{UrlEntry, UrlStatus};
use crate::kernel::event_bus::{LiveEvent, LogModule, StatsUpdate};
use crate::kernel::jobs::{
    publish_job_update, GooglePayload, Job, JobContext, JobHandler, JobPayload, WorkerError,
};
use crate::kernel::metrics;

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_PUBLISH_URL: &str =
    "https://indexing.googleapis.com/v3/urlNotifications:publish";
const GOOGLE_SCOPE: &str = "https://www.googleapis.com/auth/indexing";

/// Wait between consecutive notifications.
const INTER_REQUEST_DELAY: Duration = Duration::from_secs(1);

/// Retries per URL on 5xx/network errors.
const MAX_URL_RETRIES: u32 = 3;

/// Backoff for plain 429s: 2 s, 3 s, 4.5 s.
const RATE_LIMIT_BACKOFF_MS: [u64; 3] = [2_000, 3_000, 4_500];

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// How one notification ended. Each outcome becomes one submission row;
/// HTTP-level retries happen inside `publish_notification`.
enum SubmitOutcome {
    Success {
        code: u16,
    },
    /// Recorded on the submission row; the job continues.
    PerUrlError {
        code: Option<u16>,
        message: String,
        status: UrlStatus,
    },
    /// Recorded, then the whole job stops.
    Fatal {
        code: u16,
        error: WorkerError,
    },
}

pub struct GoogleSubmitHandler {
    client: reqwest::Client,
    token_url: String,
    publish_url: String,
}

impl GoogleSubmitHandler {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_endpoints(GOOGLE_TOKEN_URL, GOOGLE_PUBLISH_URL)
    }

    /// Endpoint override used by tests.
    pub fn with_endpoints(token_url: &str, publish_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            token_url: token_url.to_string(),
            publish_url: publish_url.to_string(),
        })
    }
}

#[async_trait]
impl JobHandler for GoogleSubmitHandler {
    async fn handle(&self, payload: JobPayload, ctx: Arc<JobContext>) -> Result<(), WorkerError> {
        match payload {
            JobPayload::Google(payload) => self.submit(payload, ctx).await,
            other => Err(WorkerError::InvalidInput(format!(
                "google queue received a {} payload",
                other.queue()
            ))),
        }
    }
}

impl GoogleSubmitHandler {
    async fn submit(&self, payload: GooglePayload, ctx: Arc<JobContext>) -> Result<(), WorkerError> {
        let db = ctx.db().clone();
        let logger = ctx.logger(LogModule::Worker);

        if let Some(job) = Job::mark_processing(payload.job_id, &db).await? {
            publish_job_update(ctx.kernel(), ctx.organization_id, &job).await;
        }
        ctx.checkpoint().await?;

        let credential = Credential::find_for_engine(payload.project_id, Engine::Google, &db)
            .await?
            .ok_or_else(|| {
                WorkerError::FatalPerJob("InvalidCredential: no Google credential configured".into())
            })?;

        // Plaintext lives in a zeroizing buffer scoped to this handler
        let token = {
            let plaintext = ctx.kernel().vault.decrypt(&credential.sealed())?;
            let service_account: ServiceAccountKey = serde_json::from_str(&plaintext)
                .map_err(|e| {
                    WorkerError::FatalPerJob(format!(
                        "InvalidCredential: malformed service account json: {e}"
                    ))
                })?;
            self.fetch_access_token(&service_account).await?
        };
        Credential::touch_last_used(credential.id, &db).await?;

        let quota_limit = ctx.kernel().google_daily_quota;
        let used = QuotaUsage::used_today(payload.project_id, Engine::Google, &db).await?;
        let remaining = quota_limit - used;
        if remaining <= 0 {
            return Err(WorkerError::FatalPerJob(format!(
                "QuotaExhausted: daily Google quota of {quota_limit} reached"
            )));
        }

        let budget = (remaining as usize).min(payload.url_ids.len());
        if budget < payload.url_ids.len() {
            logger
                .warn(
                    format!(
                        "quota allows {budget} of {} urls today, deferring the rest",
                        payload.url_ids.len()
                    ),
                    json!({"used": used, "limit": quota_limit}),
                )
                .await;
        }

        let url_refs = UrlEntry::list_by_ids(&payload.url_ids[..budget], &db).await?;
        ctx.add_items(url_refs.len() as i64, 0).await?;

        let total = url_refs.len();
        let mut successes = 0i64;
        let mut outcome: Result<(), WorkerError> = Ok(());

        for (index, url_ref) in url_refs.iter().enumerate() {
            if let Err(e) = ctx.checkpoint().await {
                outcome = Err(e);
                break;
            }

            if index > 0 {
                tokio::time::sleep(INTER_REQUEST_DELAY).await;
            }

            let cancel = ctx.cancellation();
            let submitted = self
                .publish_notification(&token, &url_ref.loc, payload.action.as_str(), &cancel)
                .await;

            let submitted = match submitted {
                Ok(submitted) => submitted,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };

            match submitted {
                SubmitOutcome::Success { code } => {
                    Submission::builder()
                        .url_id(url_ref.id)
                        .project_id(payload.project_id)
                        .engine(Engine::Google)
                        .action(payload.action)
                        .status(SubmissionStatus::Completed)
                        .response_code(code as i32)
                        .started_at(Utc::now())
                        .completed_at(Utc::now())
                        .build()
                        .append(&db)
                        .await?;
                    UrlEntry::set_google_status(url_ref.id, UrlStatus::Submitted, &db).await?;
                    metrics::GOOGLE_SUBMISSIONS.with_label_values(&["success"]).inc();
                    successes += 1;

                    logger
                        .success(format!("submitted to google: {}", url_ref.loc), json!({}))
                        .await;
                }
                SubmitOutcome::PerUrlError {
                    code,
                    message,
                    status,
                } => {
                    Submission::builder()
                        .url_id(url_ref.id)
                        .project_id(payload.project_id)
                        .engine(Engine::Google)
                        .action(payload.action)
                        .status(SubmissionStatus::Failed)
                        .response_code(code.map(i32::from).unwrap_or(0))
                        .error_message(message.clone())
                        .started_at(Utc::now())
                        .completed_at(Utc::now())
                        .build()
                        .append(&db)
                        .await?;
                    UrlEntry::set_google_status(url_ref.id, status, &db).await?;
                    metrics::GOOGLE_SUBMISSIONS.with_label_values(&["failed"]).inc();

                    logger
                        .error(
                            format!("google rejected {}", url_ref.loc),
                            json!({"statusCode": code, "error": message}),
                        )
                        .await;
                }
                SubmitOutcome::Fatal { code, error } => {
                    Submission::builder()
                        .url_id(url_ref.id)
                        .project_id(payload.project_id)
                        .engine(Engine::Google)
                        .action(payload.action)
                        .status(SubmissionStatus::Failed)
                        .response_code(code as i32)
                        .error_message(error.to_string())
                        .started_at(Utc::now())
                        .completed_at(Utc::now())
                        .build()
                        .append(&db)
                        .await?;
                    UrlEntry::set_google_status(url_ref.id, UrlStatus::Error4xx, &db).await?;
                    metrics::GOOGLE_SUBMISSIONS.with_label_values(&["failed"]).inc();

                    outcome = Err(error);
                    break;
                }
            }

            ctx.add_items(0, 1).await?;
            ctx.report_progress((((index + 1) * 100) / total.max(1)) as i32)
                .await?;
        }

        // Successes consumed quota even when the job stopped early
        if successes > 0 {
            QuotaUsage::increment(payload.project_id, Engine::Google, successes, quota_limit, &db)
                .await?;
            Project::touch_last_submission(payload.project_id, &db).await?;
        }

        outcome?;

        let counters = Project::update_counters(payload.project_id, &db).await?;
        ctx.kernel()
            .event_bus
            .publish(
                ctx.organization_id,
                payload.project_id,
                LiveEvent::StatsUpdate(StatsUpdate {
                    project_id: payload.project_id,
                    total: counters.total,
                    indexed: counters.indexed,
                    pending: counters.pending,
                    error: counters.error,
                }),
            )
            .await;
        if let Some(job) = Job::complete(payload.job_id, &db).await? {
            publish_job_update(ctx.kernel(), ctx.organization_id, &job).await;
        }
        logger
            .success(
                format!("google submission finished: {successes}/{total} accepted"),
                json!({"submitted": successes}),
            )
            .await;

        Ok(())
    }

    /// Exchange a signed assertion for a bearer token.
    async fn fetch_access_token(
        &self,
        service_account: &ServiceAccountKey,
    ) -> Result<String, WorkerError> {
        let assertion = sign_assertion(service_account, &self.token_url)?;

        let started = Instant::now();
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| WorkerError::Transient(format!("token exchange failed: {e}")))?;
        metrics::API_LATENCY_MS
            .with_label_values(&["google_oauth"])
            .observe(started.elapsed().as_millis() as f64);

        let status = response.status();
        if status.is_success() {
            let token: TokenResponse = response.json().await.map_err(|e| {
                WorkerError::Transient(format!("malformed token response: {e}"))
            })?;
            return Ok(token.access_token);
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Err(WorkerError::FatalPerJob(format!(
                "InvalidCredential: token exchange rejected ({status}): {body}"
            )));
        }
        Err(WorkerError::Transient(format!(
            "token endpoint error {status}: {body}"
        )))
    }

    /// Publish one notification with per-URL retry.
    async fn publish_notification(
        &self,
        token: &str,
        loc: &str,
        action: &str,
        cancel: &CancellationToken,
    ) -> Result<SubmitOutcome, WorkerError> {
        let mut rate_limit_hits = 0usize;
        let mut last_error = String::new();
        let mut retries = 0u32;

        loop {
            let started = Instant::now();
            let request = self
                .client
                .post(&self.publish_url)
                .bearer_auth(token)
                .json(&json!({"url": loc, "type": action}))
                .send();

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(WorkerError::Aborted),
                r = request => r,
            };
            metrics::API_LATENCY_MS
                .with_label_values(&["google_indexing"])
                .observe(started.elapsed().as_millis() as f64);

            match response {
                Ok(response) => {
                    let status = response.status();
                    let code = status.as_u16();

                    if status.is_success() {
                        return Ok(SubmitOutcome::Success { code });
                    }

                    let body = response.text().await.unwrap_or_default();
                    let lowered = body.to_lowercase();

                    if code == 403
                        && (lowered.contains("permission") || lowered.contains("ownership"))
                    {
                        return Ok(SubmitOutcome::Fatal {
                            code,
                            error: WorkerError::FatalPerJob(format!(
                                "PermissionDenied: google rejected the service account: {body}"
                            )),
                        });
                    }

                    if code == 429 {
                        if lowered.contains("quota") {
                            return Ok(SubmitOutcome::Fatal {
                                code,
                                error: WorkerError::FatalPerJob(format!(
                                    "QuotaExceeded: google daily quota exhausted: {body}"
                                )),
                            });
                        }
                        // plain rate limit: 2 s → 3 s → 4.5 s
                        if rate_limit_hits < RATE_LIMIT_BACKOFF_MS.len() {
                            let backoff =
                                Duration::from_millis(RATE_LIMIT_BACKOFF_MS[rate_limit_hits]);
                            rate_limit_hits += 1;
                            tokio::select! {
                                _ = cancel.cancelled() => return Err(WorkerError::Aborted),
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            continue;
                        }
                        return Ok(SubmitOutcome::PerUrlError {
                            code: Some(code),
                            message: format!("rate limited after retries: {body}"),
                            status: UrlStatus::Error4xx,
                        });
                    }

                    if status.is_client_error() {
                        return Ok(SubmitOutcome::PerUrlError {
                            code: Some(code),
                            message: body,
                            status: UrlStatus::Error4xx,
                        });
                    }

                    // 5xx
                    last_error = format!("http status {code}: {body}");
                    if retries >= MAX_URL_RETRIES {
                        return Ok(SubmitOutcome::PerUrlError {
                            code: Some(code),
                            message: last_error,
                            status: UrlStatus::Error5xx,
                        });
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    if retries >= MAX_URL_RETRIES {
                        return Ok(SubmitOutcome::PerUrlError {
                            code: None,
                            message: last_error,
                            status: UrlStatus::CrawlError,
                        });
                    }
                }
            }

            let backoff = Duration::from_secs(1) * 2u32.pow(retries);
            retries += 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(WorkerError::Aborted),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

/// RS256 JWT: iss = service account email, scope = indexing, aud = token
/// endpoint, one hour validity.
fn sign_assertion(
    service_account: &ServiceAccountKey,
    token_url: &str,
) -> Result<String, WorkerError> {
    let key = EncodingKey::from_rsa_pem(service_account.private_key.as_bytes()).map_err(|e| {
        WorkerError::FatalPerJob(format!("InvalidCredential: unusable private key: {e}"))
    })?;

    let now = Utc::now().timestamp();
    let claims = AssertionClaims {
        iss: &service_account.client_email,
        scope: GOOGLE_SCOPE,
        aud: token_url,
        iat: now,
        exp: now + 3_600,
    };

    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| WorkerError::FatalPerJob(format!("InvalidCredential: jwt signing failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_backoff_grows_by_half() {
        assert_eq!(RATE_LIMIT_BACKOFF_MS, [2_000, 3_000, 4_500]);
    }

    #[test]
    fn malformed_private_key_is_fatal() {
        let service_account = ServiceAccountKey {
            client_email: "svc@project.iam.gserviceaccount.com".to_string(),
            private_key: "not a pem".to_string(),
        };
        let err = sign_assertion(&service_account, GOOGLE_TOKEN_URL).unwrap_err();
        assert!(matches!(err, WorkerError::FatalPerJob(_)));
        assert!(err.to_string().contains("InvalidCredential"));
    }
}
