//! Shared fixtures: kernel construction, projects, jobs, credentials, and a
//! worker-equivalent delivery driver.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use server_core::common::sql::Record;
use server_core::domains::credentials::Credential;
use server_core::domains::projects::Project;
use server_core::domains::submissions::Engine;
use server_core::kernel::jobs::{
    Job, JobContext, JobHandler, JobPayload, JobType, WorkerError,
};
use server_core::kernel::nats::TestNats;
use server_core::kernel::ServerKernel;
use server_core::Config;

pub fn test_config() -> Config {
    Config {
        database_url: String::new(),
        nats_url: None,
        port: 0,
        encryption_key: "integration-test-master-passphrase!!".to_string(),
        log_level: "info".to_string(),
        app_version: "test".to_string(),
        jwt_secret: "integration-test-jwt-secret".to_string(),
        jwt_issuer: "sitesync".to_string(),
        google_daily_quota: 200,
    }
}

/// Kernel wired to the test database and a capturing NATS double.
pub fn test_kernel(pool: PgPool) -> (Arc<ServerKernel>, Arc<TestNats>) {
    let nats = Arc::new(TestNats::new());
    let kernel = ServerKernel::new(pool, &test_config(), nats.clone());
    (kernel, nats)
}

pub async fn create_project(pool: &PgPool, root_sitemap_url: &str) -> Result<Project> {
    let domain = root_sitemap_url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .split('/')
        .next()
        .unwrap_or("example.com")
        .to_string();

    Project::builder()
        .organization_id(Uuid::new_v4())
        .domain(domain)
        .root_sitemap_url(root_sitemap_url)
        .build()
        .insert(pool)
        .await
}

pub async fn create_job(pool: &PgPool, project_id: Uuid, job_type: JobType) -> Result<Job> {
    Job::immediate(project_id, job_type).insert(pool).await
}

/// Encrypt and store an IndexNow key for a project; returns the key.
pub async fn seed_indexnow_key(kernel: &ServerKernel, project_id: Uuid) -> Result<String> {
    let key = server_core::kernel::generate_indexnow_key();
    let sealed = kernel.vault.encrypt(&key)?;
    Credential::store(project_id, Engine::Indexnow, "api_key", &sealed, &kernel.db_pool).await?;
    Ok(key)
}

/// Generate a service-account JSON with a fresh RSA key and store it
/// encrypted for a project.
pub async fn seed_google_credential(kernel: &ServerKernel, project_id: Uuid) -> Result<()> {
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use rsa::RsaPrivateKey;

    let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)?;
    let pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();

    let service_account = serde_json::json!({
        "type": "service_account",
        "client_email": "indexer@test-project.iam.gserviceaccount.com",
        "private_key": pem,
    });

    let sealed = kernel.vault.encrypt(&service_account.to_string())?;
    Credential::store(
        project_id,
        Engine::Google,
        "service_account",
        &sealed,
        &kernel.db_pool,
    )
    .await?;
    Ok(())
}

/// Run one delivery the way `QueueWorker` would: build the context, invoke
/// the handler, and apply the terminal job transition for the error class.
pub async fn run_delivery(
    kernel: &Arc<ServerKernel>,
    handler: &dyn JobHandler,
    payload: JobPayload,
) -> Result<(), WorkerError> {
    let cancel = tokio_util::sync::CancellationToken::new();
    let ctx = JobContext::load(
        kernel.clone(),
        payload.job_id(),
        payload.project_id(),
        cancel,
    )
    .await?;

    let job_id = payload.job_id();
    let result = handler.handle(payload, ctx).await;
    match &result {
        Ok(()) => {}
        Err(WorkerError::Aborted) => {
            let _ = Job::cancel(job_id, "Job Aborted", &kernel.db_pool).await;
        }
        Err(e) if !e.retryable() => {
            let _ = Job::fail(job_id, &e.to_string(), &kernel.db_pool).await;
        }
        Err(_) => {}
    }
    result
}

/// Drain the scanner queue to completion, processing each delivery inline.
pub async fn drive_scanner_queue(
    kernel: &Arc<ServerKernel>,
    handler: &dyn JobHandler,
) -> Result<()> {
    loop {
        let deliveries = kernel
            .queue
            .claim(
                server_core::kernel::jobs::QUEUE_SCANNER,
                "test-driver",
                10,
            )
            .await?;
        if deliveries.is_empty() {
            return Ok(());
        }

        for delivery in deliveries {
            let payload = delivery.parse_payload()?;
            match run_delivery(kernel, handler, payload).await {
                Ok(()) | Err(WorkerError::Aborted) => {
                    kernel.queue.mark_completed(delivery.id).await?;
                }
                Err(e) if e.retryable() => {
                    kernel.queue.mark_failed(&delivery, true).await?;
                }
                Err(_) => {
                    kernel.queue.mark_failed(&delivery, false).await?;
                }
            }
        }
    }
}
