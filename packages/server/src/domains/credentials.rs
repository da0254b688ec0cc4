//! Encrypted engine credentials, one per `(project, engine)`.
//!
//! Rows hold only ciphertext material; the vault decrypts into a scoped
//! buffer at submission time and nothing else ever sees the plaintext.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::submissions::Engine;
use crate::kernel::vault::EncryptedCredential;

#[derive(FromRow, Debug, Clone)]
pub struct Credential {
    pub id: Uuid,
    pub project_id: Uuid,
    pub engine: Engine,
    pub credential_type: String,
    pub encrypted_data: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub salt: Vec<u8>,
    pub is_valid: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const CREDENTIAL_COLUMNS: &str = "id, project_id, engine, credential_type, encrypted_data, iv, \
     auth_tag, salt, is_valid, expires_at, last_used_at, created_at, updated_at";

impl Credential {
    pub async fn find_for_engine(
        project_id: Uuid,
        engine: Engine,
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE project_id = $1 AND engine = $2"
        ))
        .bind(project_id)
        .bind(engine)
        .fetch_optional(db)
        .await?;

        Ok(row)
    }

    /// Store (or replace) a project's credential for an engine.
    pub async fn store(
        project_id: Uuid,
        engine: Engine,
        credential_type: &str,
        sealed: &EncryptedCredential,
        db: &PgPool,
    ) -> Result<Self> {
        let row = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO credentials (
                id, project_id, engine, credential_type, encrypted_data, iv, auth_tag, salt
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (project_id, engine) DO UPDATE SET
                credential_type = EXCLUDED.credential_type,
                encrypted_data = EXCLUDED.encrypted_data,
                iv = EXCLUDED.iv,
                auth_tag = EXCLUDED.auth_tag,
                salt = EXCLUDED.salt,
                is_valid = TRUE,
                updated_at = NOW()
            RETURNING {CREDENTIAL_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(engine)
        .bind(credential_type)
        .bind(&sealed.encrypted_data)
        .bind(&sealed.iv)
        .bind(&sealed.auth_tag)
        .bind(&sealed.salt)
        .fetch_one(db)
        .await?;

        Ok(row)
    }

    /// The ciphertext material in the shape the vault consumes.
    pub fn sealed(&self) -> EncryptedCredential {
        EncryptedCredential {
            encrypted_data: self.encrypted_data.clone(),
            iv: self.iv.clone(),
            auth_tag: self.auth_tag.clone(),
            salt: self.salt.clone(),
        }
    }

    pub async fn touch_last_used(id: Uuid, db: &PgPool) -> Result<()> {
        sqlx::query("UPDATE credentials SET last_used_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Flag a credential the engine rejected; operators must re-upload.
    pub async fn mark_invalid(id: Uuid, db: &PgPool) -> Result<()> {
        sqlx::query("UPDATE credentials SET is_valid = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }
}
