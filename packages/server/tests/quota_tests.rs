//! Quota bookkeeping under concurrency: increments are atomic and the
//! counter never moves backwards.

mod common;

use common::*;
use server_core::domains::quota::QuotaUsage;
use server_core::domains::submissions::Engine;

#[tokio::test]
async fn concurrent_increments_sum_exactly() {
    let pool = test_pool().await;
    let project = create_project(&pool, "https://example.com/sitemap.xml")
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        let project_id = project.id;
        handles.push(tokio::spawn(async move {
            QuotaUsage::increment(project_id, Engine::Google, 5, 200, &pool).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let used = QuotaUsage::used_today(project.id, Engine::Google, &pool)
        .await
        .unwrap();
    assert_eq!(used, 50);
}

#[tokio::test]
async fn increments_only_grow_the_counter() {
    let pool = test_pool().await;
    let project = create_project(&pool, "https://example.com/sitemap.xml")
        .await
        .unwrap();

    let mut last = 0;
    for delta in [3, 1, 7, 2] {
        let used = QuotaUsage::increment(project.id, Engine::Indexnow, delta, 10_000, &pool)
            .await
            .unwrap();
        assert!(used > last);
        last = used;
    }
    assert_eq!(last, 13);
}

#[tokio::test]
async fn engines_and_days_are_tracked_separately() {
    let pool = test_pool().await;
    let project = create_project(&pool, "https://example.com/sitemap.xml")
        .await
        .unwrap();

    QuotaUsage::increment(project.id, Engine::Google, 4, 200, &pool)
        .await
        .unwrap();
    QuotaUsage::increment(project.id, Engine::Indexnow, 9, 10_000, &pool)
        .await
        .unwrap();

    assert_eq!(
        QuotaUsage::used_today(project.id, Engine::Google, &pool)
            .await
            .unwrap(),
        4
    );
    assert_eq!(
        QuotaUsage::used_today(project.id, Engine::Indexnow, &pool)
            .await
            .unwrap(),
        9
    );

    let row = QuotaUsage::find(project.id, Engine::Google, QuotaUsage::today(), &pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.quota_limit, 200);
}
