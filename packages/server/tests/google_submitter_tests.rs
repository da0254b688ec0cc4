//! Google submitter flows against mock OAuth and Indexing endpoints:
//! quota truncation, permission denial short-circuit, and per-URL errors.

mod common;

use common::*;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use server_core::domains::quota::QuotaUsage;
use server_core::domains::submissions::{Engine, Submission, SubmissionAction, SubmissionStatus};
use server_core::domains::urls::{UrlEntry, UrlStatus};
use server_core::kernel::jobs::{GooglePayload, Job, JobPayload, JobStatus, JobType, WorkerError};
use server_core::sitemap::SitemapUrl;
use server_core::workers::GoogleSubmitHandler;

const TOKEN_PATH: &str = "/token";
const PUBLISH_PATH: &str = "/v3/urlNotifications:publish";

async fn mount_token_endpoint(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "test-bearer-token",
            "token_type": "Bearer",
            "expires_in": 3600,
        })))
        .mount(server)
        .await;
}

fn handler_for(server: &MockServer) -> GoogleSubmitHandler {
    GoogleSubmitHandler::with_endpoints(
        &format!("{}{}", server.uri(), TOKEN_PATH),
        &format!("{}{}", server.uri(), PUBLISH_PATH),
    )
    .unwrap()
}

/// Seed `count` discovered URLs and return their ids in insertion order.
async fn seed_urls(
    pool: &sqlx::PgPool,
    project_id: uuid::Uuid,
    count: usize,
) -> Vec<uuid::Uuid> {
    let entries: Vec<SitemapUrl> = (0..count)
        .map(|i| SitemapUrl {
            loc: format!("http://t/page-{i}"),
            lastmod: None,
            changefreq: None,
            priority: None,
        })
        .collect();
    UrlEntry::upsert_batch(project_id, None, &entries, pool)
        .await
        .unwrap();

    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let entry = UrlEntry::find_by_loc(project_id, &format!("http://t/page-{i}"), pool)
            .await
            .unwrap()
            .unwrap();
        ids.push(entry.id);
    }
    ids
}

#[tokio::test]
async fn quota_boundary_truncates_the_batch_and_completes() {
    let pool = test_pool().await;
    let (kernel, _) = test_kernel(pool.clone());
    let server = MockServer::start().await;

    mount_token_endpoint(&server).await;
    Mock::given(method("POST"))
        .and(path(PUBLISH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"urlNotificationMetadata": {}})))
        .expect(2)
        .mount(&server)
        .await;

    let project = create_project(&pool, "https://example.com/sitemap.xml")
        .await
        .unwrap();
    seed_google_credential(&kernel, project.id).await.unwrap();
    let url_ids = seed_urls(&pool, project.id, 5).await;

    // 198 of 200 already consumed today
    QuotaUsage::increment(project.id, Engine::Google, 198, 200, &pool)
        .await
        .unwrap();

    let job = create_job(&pool, project.id, JobType::GoogleSubmission)
        .await
        .unwrap();
    let payload = JobPayload::Google(GooglePayload {
        project_id: project.id,
        job_id: job.id,
        url_ids: url_ids.clone(),
        action: SubmissionAction::UrlUpdated,
    });

    let handler = handler_for(&server);
    run_delivery(&kernel, &handler, payload).await.unwrap();

    // exactly two submitted, quota capped at 200
    let used = QuotaUsage::used_today(project.id, Engine::Google, &pool)
        .await
        .unwrap();
    assert_eq!(used, 200);

    for (i, url_id) in url_ids.iter().enumerate() {
        let entry = UrlEntry::find_by_loc(project.id, &format!("http://t/page-{i}"), &pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.id, *url_id);
        if i < 2 {
            assert_eq!(entry.google_status, UrlStatus::Submitted);
            assert!(entry.google_submitted_at.is_some());
        } else {
            assert_eq!(entry.google_status, UrlStatus::Discovered);
        }
    }

    let job = Job::find_by_id(job.id, &pool).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    server.verify().await;
}

#[tokio::test]
async fn exhausted_quota_fails_without_any_request() {
    let pool = test_pool().await;
    let (kernel, _) = test_kernel(pool.clone());
    let server = MockServer::start().await;

    mount_token_endpoint(&server).await;
    Mock::given(method("POST"))
        .and(path(PUBLISH_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let project = create_project(&pool, "https://example.com/sitemap.xml")
        .await
        .unwrap();
    seed_google_credential(&kernel, project.id).await.unwrap();
    let url_ids = seed_urls(&pool, project.id, 3).await;

    QuotaUsage::increment(project.id, Engine::Google, 200, 200, &pool)
        .await
        .unwrap();

    let job = create_job(&pool, project.id, JobType::GoogleSubmission)
        .await
        .unwrap();
    let payload = JobPayload::Google(GooglePayload {
        project_id: project.id,
        job_id: job.id,
        url_ids,
        action: SubmissionAction::UrlUpdated,
    });

    let handler = handler_for(&server);
    let err = run_delivery(&kernel, &handler, payload).await.unwrap_err();
    assert!(matches!(err, WorkerError::FatalPerJob(_)));
    assert!(err.to_string().contains("QuotaExhausted"));

    let job = Job::find_by_id(job.id, &pool).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("QuotaExhausted"));

    server.verify().await;
}

#[tokio::test]
async fn permission_denial_stops_after_the_first_request() {
    let pool = test_pool().await;
    let (kernel, _) = test_kernel(pool.clone());
    let server = MockServer::start().await;

    mount_token_endpoint(&server).await;
    Mock::given(method("POST"))
        .and(path(PUBLISH_PATH))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"code": 403, "message": "Permission denied: ownership verification failed"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let project = create_project(&pool, "https://example.com/sitemap.xml")
        .await
        .unwrap();
    seed_google_credential(&kernel, project.id).await.unwrap();
    let url_ids = seed_urls(&pool, project.id, 4).await;

    let job = create_job(&pool, project.id, JobType::GoogleSubmission)
        .await
        .unwrap();
    let payload = JobPayload::Google(GooglePayload {
        project_id: project.id,
        job_id: job.id,
        url_ids: url_ids.clone(),
        action: SubmissionAction::UrlUpdated,
    });

    let handler = handler_for(&server);
    let err = run_delivery(&kernel, &handler, payload).await.unwrap_err();
    assert!(err.to_string().contains("PermissionDenied"));

    let job = Job::find_by_id(job.id, &pool).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("PermissionDenied"));

    // exactly one submission row, for the first URL only
    let mut total_rows = 0;
    for url_id in &url_ids {
        total_rows += Submission::list_for_url(*url_id, &pool).await.unwrap().len();
    }
    assert_eq!(total_rows, 1);

    // no quota consumed by failures
    assert_eq!(
        QuotaUsage::used_today(project.id, Engine::Google, &pool)
            .await
            .unwrap(),
        0
    );

    server.verify().await;
}

#[tokio::test]
async fn plain_4xx_is_a_per_url_error_and_the_job_continues() {
    let pool = test_pool().await;
    let (kernel, _) = test_kernel(pool.clone());
    let server = MockServer::start().await;

    mount_token_endpoint(&server).await;
    // first request 400, the rest succeed; wiremock consumes mocks in order
    Mock::given(method("POST"))
        .and(path(PUBLISH_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": 400, "message": "Unknown URL scheme"}
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(PUBLISH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let project = create_project(&pool, "https://example.com/sitemap.xml")
        .await
        .unwrap();
    seed_google_credential(&kernel, project.id).await.unwrap();
    let url_ids = seed_urls(&pool, project.id, 2).await;

    let job = create_job(&pool, project.id, JobType::GoogleSubmission)
        .await
        .unwrap();
    let payload = JobPayload::Google(GooglePayload {
        project_id: project.id,
        job_id: job.id,
        url_ids: url_ids.clone(),
        action: SubmissionAction::UrlUpdated,
    });

    let handler = handler_for(&server);
    run_delivery(&kernel, &handler, payload).await.unwrap();

    let job = Job::find_by_id(job.id, &pool).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let first = UrlEntry::find_by_loc(project.id, "http://t/page-0", &pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.google_status, UrlStatus::Error4xx);

    let second = UrlEntry::find_by_loc(project.id, "http://t/page-1", &pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.google_status, UrlStatus::Submitted);

    // only the success consumed quota
    assert_eq!(
        QuotaUsage::used_today(project.id, Engine::Google, &pool)
            .await
            .unwrap(),
        1
    );

    let rows = Submission::list_for_url(url_ids[0], &pool).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SubmissionStatus::Failed);
    assert_eq!(rows[0].response_code, Some(400));
}
