//! Prometheus metrics for the worker subsystem.
//!
//! Counters and histograms are updated inline by the workers; DB-derived
//! gauges (queue depth, active jobs) are refreshed by a 60 s background
//! tick. The `/metrics` endpoint serves the text exposition format.

use std::sync::{LazyLock, Once};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Gauge refresh period.
pub const EXPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static URLS_DISCOVERED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "urls_discovered_total",
        "Total number of URL entries discovered in sitemaps",
    )
    .expect("metric creation failed")
});

pub static GOOGLE_SUBMISSIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "google_submissions_total",
            "Google Indexing API submissions by outcome",
        ),
        &["status"],
    )
    .expect("metric creation failed")
});

pub static INDEXNOW_SUBMISSIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "indexnow_submissions_total",
            "IndexNow submissions by outcome",
        ),
        &["status"],
    )
    .expect("metric creation failed")
});

pub static ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("errors_total", "Worker errors by kind"),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static JOBS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(Opts::new("jobs_total", "Jobs processed by type"), &["type"])
        .expect("metric creation failed")
});

pub static JOB_DURATION_MS: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new("job_duration_ms", "End-to-end job duration in milliseconds")
            .buckets(vec![
                50.0, 250.0, 1_000.0, 5_000.0, 15_000.0, 60_000.0, 300_000.0, 900_000.0,
            ]),
        &["type"],
    )
    .expect("metric creation failed")
});

pub static SITEMAP_SCAN_DURATION_MS: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "sitemap_scan_duration_ms",
            "Fetch-and-parse duration for a single sitemap in milliseconds",
        )
        .buckets(vec![25.0, 100.0, 500.0, 2_000.0, 10_000.0, 30_000.0, 60_000.0]),
    )
    .expect("metric creation failed")
});

pub static API_LATENCY_MS: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new("api_latency_ms", "External API call latency in milliseconds")
            .buckets(vec![25.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 10_000.0, 30_000.0]),
        &["api"],
    )
    .expect("metric creation failed")
});

pub static ACTIVE_JOBS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("active_jobs", "Jobs currently in processing state")
        .expect("metric creation failed")
});

pub static QUEUE_SIZE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new("queue_size", "Queued deliveries per queue"),
        &["queue"],
    )
    .expect("metric creation failed")
});

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry. Idempotent.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let registry = &*REGISTRY;
        registry
            .register(Box::new(URLS_DISCOVERED.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(GOOGLE_SUBMISSIONS.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(INDEXNOW_SUBMISSIONS.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(ERRORS.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(JOBS.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(JOB_DURATION_MS.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(SITEMAP_SCAN_DURATION_MS.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(API_LATENCY_MS.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(ACTIVE_JOBS.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(QUEUE_SIZE.clone()))
            .expect("metric registration failed");
    });
}

/// Serve the registry in Prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Refresh DB-derived gauges every export interval until shutdown.
pub async fn run_gauge_refresher(pool: PgPool, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(EXPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = refresh_gauges(&pool).await {
                    warn!(error = %e, "failed to refresh gauges");
                }
            }
        }
    }
}

async fn refresh_gauges(pool: &PgPool) -> anyhow::Result<()> {
    let queued: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT queue, COUNT(*) FROM queue_jobs
        WHERE status = 'queued'
        GROUP BY queue
        "#,
    )
    .fetch_all(pool)
    .await?;

    for queue in crate::kernel::jobs::QUEUE_NAMES {
        let depth = queued
            .iter()
            .find(|(name, _)| name == queue)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        QUEUE_SIZE.with_label_values(&[queue]).set(depth);
    }

    let active: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'processing'")
            .fetch_one(pool)
            .await?;
    ACTIVE_JOBS.set(active);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        register_metrics();
        register_metrics();
        URLS_DISCOVERED.inc();
        assert!(URLS_DISCOVERED.get() >= 1);
    }

    #[test]
    fn labelled_counters_accept_expected_labels() {
        register_metrics();
        GOOGLE_SUBMISSIONS.with_label_values(&["success"]).inc();
        INDEXNOW_SUBMISSIONS.with_label_values(&["failed"]).inc();
        ERRORS.with_label_values(&["transient"]).inc();
        JOBS.with_label_values(&["full_scan"]).inc();
        assert!(GOOGLE_SUBMISSIONS.with_label_values(&["success"]).get() >= 1);
    }
}
