//! Credential storage round-trips: ciphertext in, identical plaintext out,
//! and tamper detection through the stored columns.

mod common;

use common::*;
use server_core::domains::credentials::Credential;
use server_core::domains::submissions::Engine;
use server_core::kernel::VaultError;

#[tokio::test]
async fn stored_credentials_decrypt_to_the_original() {
    let pool = test_pool().await;
    let (kernel, _) = test_kernel(pool.clone());
    let project = create_project(&pool, "https://example.com/sitemap.xml")
        .await
        .unwrap();

    let secret = r#"{"type":"service_account","client_email":"svc@p.iam"}"#;
    let sealed = kernel.vault.encrypt(secret).unwrap();
    Credential::store(project.id, Engine::Google, "service_account", &sealed, &pool)
        .await
        .unwrap();

    let loaded = Credential::find_for_engine(project.id, Engine::Google, &pool)
        .await
        .unwrap()
        .unwrap();
    assert!(loaded.is_valid);
    assert_eq!(loaded.credential_type, "service_account");

    let plaintext = kernel.vault.decrypt(&loaded.sealed()).unwrap();
    assert_eq!(plaintext.as_str(), secret);
}

#[tokio::test]
async fn tampered_stored_ciphertext_fails_decryption() {
    let pool = test_pool().await;
    let (kernel, _) = test_kernel(pool.clone());
    let project = create_project(&pool, "https://example.com/sitemap.xml")
        .await
        .unwrap();

    let sealed = kernel.vault.encrypt("0123456789abcdef0123456789abcdef").unwrap();
    Credential::store(project.id, Engine::Indexnow, "api_key", &sealed, &pool)
        .await
        .unwrap();

    let loaded = Credential::find_for_engine(project.id, Engine::Indexnow, &pool)
        .await
        .unwrap()
        .unwrap();
    let mut corrupted = loaded.sealed();
    corrupted.auth_tag[0] ^= 0x01;

    assert!(matches!(
        kernel.vault.decrypt(&corrupted),
        Err(VaultError::InvalidCredential)
    ));
}

#[tokio::test]
async fn replacing_a_credential_keeps_one_row_per_engine() {
    let pool = test_pool().await;
    let (kernel, _) = test_kernel(pool.clone());
    let project = create_project(&pool, "https://example.com/sitemap.xml")
        .await
        .unwrap();

    let first = kernel.vault.encrypt("first-key").unwrap();
    let stored = Credential::store(project.id, Engine::Indexnow, "api_key", &first, &pool)
        .await
        .unwrap();
    Credential::mark_invalid(stored.id, &pool).await.unwrap();

    let second = kernel.vault.encrypt("second-key").unwrap();
    let replaced = Credential::store(project.id, Engine::Indexnow, "api_key", &second, &pool)
        .await
        .unwrap();

    // same row, re-validated, new ciphertext
    assert_eq!(stored.id, replaced.id);
    assert!(replaced.is_valid);

    let plaintext = kernel.vault.decrypt(&replaced.sealed()).unwrap();
    assert_eq!(plaintext.as_str(), "second-key");
}
