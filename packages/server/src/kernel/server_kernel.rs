// ServerKernel - core infrastructure with all dependencies
//
// Holds the database pool, the credential vault, the live event bus, and the
// queue broker, and is shared by workers and routes via Arc.

use sqlx::PgPool;
use std::sync::Arc;

use crate::config::Config;
use crate::kernel::event_bus::EventBus;
use crate::kernel::jobs::PostgresQueue;
use crate::kernel::nats::NatsPublisher;
use crate::kernel::vault::CredentialVault;

pub struct ServerKernel {
    pub db_pool: PgPool,
    pub vault: CredentialVault,
    pub event_bus: EventBus,
    pub queue: PostgresQueue,
    /// Daily Google Indexing API quota per project.
    pub google_daily_quota: i64,
}

impl ServerKernel {
    pub fn new(db_pool: PgPool, config: &Config, nats: Arc<dyn NatsPublisher>) -> Arc<Self> {
        Arc::new(Self {
            queue: PostgresQueue::new(db_pool.clone()),
            vault: CredentialVault::new(config.encryption_key.clone()),
            event_bus: EventBus::new(nats),
            google_daily_quota: config.google_daily_quota,
            db_pool,
        })
    }
}
