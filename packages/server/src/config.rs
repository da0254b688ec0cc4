use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;

/// Daily Google Indexing API quota per project.
pub const GOOGLE_DAILY_QUOTA: i64 = 200;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Optional; without it the live event bus runs without the
    /// cross-instance mirror.
    pub nats_url: Option<String>,
    pub port: u16,
    /// Master passphrase for the credential vault. Must be at least 32
    /// characters; startup fails otherwise.
    pub encryption_key: String,
    pub log_level: String,
    pub app_version: String,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub google_daily_quota: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let encryption_key = env::var("ENCRYPTION_KEY").context("ENCRYPTION_KEY must be set")?;
        validate_encryption_key(&encryption_key)?;

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            nats_url: env::var("NATS_URL").ok(),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            encryption_key,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            app_version: env::var("APP_VERSION").unwrap_or_else(|_| "dev".to_string()),
            jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "sitesync".to_string()),
            google_daily_quota: env::var("GOOGLE_DAILY_QUOTA")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(GOOGLE_DAILY_QUOTA),
        })
    }
}

/// The vault key derivation refuses weak master passphrases outright.
pub fn validate_encryption_key(key: &str) -> Result<()> {
    if key.chars().count() < 32 {
        bail!("ENCRYPTION_KEY must be at least 32 characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_encryption_key_is_rejected() {
        assert!(validate_encryption_key("too-short").is_err());
    }

    #[test]
    fn long_encryption_key_is_accepted() {
        assert!(validate_encryption_key("0123456789abcdef0123456789abcdef").is_ok());
    }

    #[test]
    fn default_quota_is_200() {
        assert_eq!(GOOGLE_DAILY_QUOTA, 200);
    }
}
