pub mod event_bus;
pub mod jobs;
pub mod metrics;
pub mod nats;
pub mod server_kernel;
pub mod vault;

pub use event_bus::{EventBus, EventLogger, LiveEvent, LogEvent, LogLevel, LogModule};
pub use server_kernel::ServerKernel;
pub use vault::{generate_indexnow_key, CredentialVault, VaultError};
