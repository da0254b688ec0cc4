//! Queue worker: claims deliveries and runs the registered handler.
//!
//! One worker owns one queue. Concurrency is capped by a semaphore, claim
//! dispatch passes through a token-bucket rate limit, and a heartbeat task
//! extends the delivery lease while the handler runs. Errors are classified
//! by the handler (see `WorkerError`); the worker only acts on the
//! classification: transient failures go back to the broker for delayed
//! redelivery, fatal ones mark the job FAILED, aborts mark it CANCELLED.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::{publish_job_update, JobContext, WorkerError};
use super::job::Job;
use super::payload::{JobPayload, QUEUE_GOOGLE, QUEUE_INDEXNOW, QUEUE_SCANNER};
use super::queue::{FailureDisposition, QueueJob};
use crate::kernel::metrics;
use crate::kernel::server_kernel::ServerKernel;

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Configuration for one queue's worker pool.
#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    pub queue: &'static str,
    /// Handlers running at once.
    pub concurrency: usize,
    /// Token-bucket dispatch rate.
    pub rate_per_sec: u32,
    /// Maximum deliveries claimed per poll.
    pub batch_size: i64,
    /// Sleep when the queue is empty.
    pub poll_interval: Duration,
    /// Lease extension cadence for running handlers.
    pub heartbeat_interval: Duration,
    pub worker_id: String,
}

impl QueueWorkerConfig {
    fn for_queue(queue: &'static str, concurrency: usize, rate_per_sec: u32) -> Self {
        Self {
            queue,
            concurrency,
            rate_per_sec,
            batch_size: concurrency as i64,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            worker_id: format!("{}-{}", queue, Uuid::new_v4()),
        }
    }

    pub fn scanner() -> Self {
        Self::for_queue(QUEUE_SCANNER, 10, 50)
    }

    pub fn google() -> Self {
        Self::for_queue(QUEUE_GOOGLE, 5, 10)
    }

    pub fn indexnow() -> Self {
        Self::for_queue(QUEUE_INDEXNOW, 3, 20)
    }
}

/// Handler for one queue's payloads.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: JobPayload, ctx: Arc<JobContext>) -> Result<(), WorkerError>;
}

/// A long-running worker bound to one queue.
pub struct QueueWorker {
    kernel: Arc<ServerKernel>,
    handler: Arc<dyn JobHandler>,
    config: QueueWorkerConfig,
    limiter: DirectRateLimiter,
    semaphore: Arc<Semaphore>,
}

impl QueueWorker {
    pub fn new(
        kernel: Arc<ServerKernel>,
        handler: Arc<dyn JobHandler>,
        config: QueueWorkerConfig,
    ) -> Arc<Self> {
        let quota = Quota::per_second(
            NonZeroU32::new(config.rate_per_sec).expect("rate_per_sec must be > 0"),
        );
        Arc::new(Self {
            kernel,
            handler,
            limiter: RateLimiter::direct(quota),
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            config,
        })
    }

    /// Claim-and-dispatch loop; runs until shutdown, then drains.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            queue = self.config.queue,
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "queue worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let capacity = self
                .semaphore
                .available_permits()
                .min(self.config.batch_size as usize);
            if capacity == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                continue;
            }

            let deliveries = match self
                .kernel
                .queue
                .claim(self.config.queue, &self.config.worker_id, capacity as i64)
                .await
            {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    error!(queue = self.config.queue, error = %e, "failed to claim deliveries");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if deliveries.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(queue = self.config.queue, count = deliveries.len(), "claimed deliveries");

            for delivery in deliveries {
                self.limiter.until_ready().await;

                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let worker = self.clone();
                let job_cancel = shutdown.child_token();
                tokio::spawn(async move {
                    worker.process_delivery(delivery, job_cancel).await;
                    drop(permit);
                });
            }
        }

        self.drain().await;
        info!(queue = self.config.queue, worker_id = %self.config.worker_id, "queue worker stopped");
    }

    /// Wait for in-flight handlers to finish, bounded at 30 s.
    async fn drain(&self) {
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        while self.semaphore.available_permits() < self.config.concurrency
            && std::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn process_delivery(&self, delivery: QueueJob, cancel: CancellationToken) {
        let payload = match delivery.parse_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(delivery_id = %delivery.id, error = %e, "undecodable payload, dropping delivery");
                let _ = self.kernel.queue.mark_failed(&delivery, false).await;
                return;
            }
        };

        let job_id = payload.job_id();
        let ctx = match JobContext::load(
            self.kernel.clone(),
            job_id,
            payload.project_id(),
            cancel.clone(),
        )
        .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to build job context");
                let _ = self.kernel.queue.mark_failed(&delivery, e.retryable()).await;
                return;
            }
        };

        // Keep the lease alive while the handler runs
        let heartbeat_cancel = cancel.child_token();
        let heartbeat_handle = {
            let queue = self.kernel.queue.clone();
            let delivery_id = delivery.id;
            let interval = self.config.heartbeat_interval;
            let cancel = heartbeat_cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // skip the immediate tick
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = queue.heartbeat(delivery_id).await {
                                warn!(delivery_id = %delivery_id, error = %e, "heartbeat failed");
                            }
                        }
                    }
                }
            })
        };

        let result = self.handler.handle(payload, ctx.clone()).await;

        heartbeat_cancel.cancel();
        let _ = heartbeat_handle.await;

        match result {
            Ok(()) => {
                debug!(job_id = %job_id, queue = self.config.queue, "delivery succeeded");
                if let Err(e) = self.kernel.queue.mark_completed(delivery.id).await {
                    error!(delivery_id = %delivery.id, error = %e, "failed to mark delivery completed");
                }
            }
            Err(WorkerError::Aborted) => {
                info!(job_id = %job_id, "delivery aborted");
                if let Ok(Some(job)) = Job::cancel(job_id, "Job Aborted", &self.kernel.db_pool).await
                {
                    publish_job_update(&self.kernel, ctx.organization_id, &job).await;
                }
                // the delivery itself is consumed; nothing to redeliver
                let _ = self.kernel.queue.mark_completed(delivery.id).await;
            }
            Err(e) => {
                metrics::ERRORS.with_label_values(&[e.kind_label()]).inc();

                if e.retryable() {
                    warn!(job_id = %job_id, error = %e, "delivery failed, scheduling redelivery");
                    match self.kernel.queue.mark_failed(&delivery, true).await {
                        Ok(FailureDisposition::Dead) => {
                            if let Ok(Some(job)) =
                                Job::fail(job_id, &e.to_string(), &self.kernel.db_pool).await
                            {
                                publish_job_update(&self.kernel, ctx.organization_id, &job).await;
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            error!(delivery_id = %delivery.id, error = %err, "failed to park delivery")
                        }
                    }
                } else {
                    warn!(job_id = %job_id, error = %e, "delivery failed fatally");
                    if let Ok(Some(job)) =
                        Job::fail(job_id, &e.to_string(), &self.kernel.db_pool).await
                    {
                        publish_job_update(&self.kernel, ctx.organization_id, &job).await;
                    }
                    let _ = self.kernel.queue.mark_failed(&delivery, false).await;
                }
            }
        }
    }
}
