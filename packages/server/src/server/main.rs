// Main entry point for the worker server

use std::sync::Arc;

use anyhow::{Context, Result};
use server_core::kernel::event_bus::run_mirror;
use server_core::kernel::jobs::{QueueWorker, QueueWorkerConfig};
use server_core::kernel::metrics::run_gauge_refresher;
use server_core::kernel::nats::{NatsClientPublisher, NatsPublisher, NoopNatsPublisher};
use server_core::kernel::ServerKernel;
use server_core::server::build_app;
use server_core::workers::{GoogleSubmitHandler, IndexNowSubmitHandler, ScannerHandler};
use server_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so LOG_LEVEL feeds the subscriber
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "{},sqlx=warn,tower_http=debug",
                    config.log_level
                ))
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!(version = %config.app_version, "Starting sitemap sync worker server");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Cross-instance broker is optional; without it events stay local
    let (nats_publisher, nats_client): (Arc<dyn NatsPublisher>, Option<async_nats::Client>) =
        match &config.nats_url {
            Some(url) => {
                let client = async_nats::connect(url)
                    .await
                    .context("Failed to connect to NATS")?;
                tracing::info!("NATS connected");
                (Arc::new(NatsClientPublisher::new(client.clone())), Some(client))
            }
            None => {
                tracing::warn!("NATS_URL not set; live events will not cross instances");
                (Arc::new(NoopNatsPublisher), None)
            }
        };

    let kernel = ServerKernel::new(pool.clone(), &config, nats_publisher);
    let shutdown = CancellationToken::new();

    if let Some(client) = nats_client {
        let bus = kernel.event_bus.clone();
        tokio::spawn(async move {
            if let Err(e) = run_mirror(bus, client).await {
                tracing::error!(error = %e, "event mirror stopped");
            }
        });
    }

    // Worker pools, one per queue
    let scanner = QueueWorker::new(
        kernel.clone(),
        Arc::new(ScannerHandler::new().context("Failed to build scanner")?),
        QueueWorkerConfig::scanner(),
    );
    let google = QueueWorker::new(
        kernel.clone(),
        Arc::new(GoogleSubmitHandler::new().context("Failed to build google submitter")?),
        QueueWorkerConfig::google(),
    );
    let indexnow = QueueWorker::new(
        kernel.clone(),
        Arc::new(IndexNowSubmitHandler::new().context("Failed to build indexnow submitter")?),
        QueueWorkerConfig::indexnow(),
    );

    let mut worker_handles = Vec::new();
    for worker in [scanner, google, indexnow] {
        worker_handles.push(tokio::spawn(worker.run(shutdown.child_token())));
    }

    tokio::spawn(run_gauge_refresher(pool.clone(), shutdown.child_token()));

    // HTTP surface: health, metrics, live job stream
    let app = build_app(kernel, &config);
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await
        .context("Server error")?;

    // Drain workers before exiting
    tracing::info!("Shutting down, draining workers...");
    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("Shutdown complete");

    Ok(())
}
