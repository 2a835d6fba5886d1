//! TransactionCoordinator integration tests over SQLite and in-process stores

mod common;

use serde_json::json;
use sqlx::{Pool, Sqlite};

use common::sqlite_pool;
use tessera_core::database::DatabasePool;
use tessera_core::transaction::{MemoryTransactionalStore, SqlStore};
use tessera_core::{ServiceError, TransactionCoordinator};

const INSERT_ROW: &str = "INSERT INTO mirror_records \
    (entity_type, business_key, mirror_id, canonical_id, payload, source_updated_at, synced_at) \
    VALUES (?, ?, ?, ?, '{}', '2024-06-01T00:00:00Z', '2024-06-01T00:00:00Z')";

/// Test helper to create a SQLite-backed transactional store
async fn create_sql_store(name: &str) -> SqlStore<Sqlite> {
    let pool = sqlite_pool().await;
    SqlStore::<Sqlite>::from_database_pool(name, &pool).expect("sqlite pool")
}

async fn row_count(pool: &Pool<Sqlite>) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM mirror_records")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn single_store_rollback_discards_writes() {
    let store = create_sql_store("accounts").await;
    let coordinator = TransactionCoordinator::new();

    let result: Result<(), ServiceError> = coordinator
        .run(&store, |tx| {
            Box::pin(async move {
                sqlx::query(INSERT_ROW)
                    .bind("account")
                    .bind("acct-1")
                    .bind("m-1")
                    .bind("c-1")
                    .execute(&mut **tx)
                    .await?;
                Err(ServiceError::ValidationError("insufficient funds".into()))
            })
        })
        .await;

    assert!(matches!(result, Err(ServiceError::ValidationError(_))));
    assert_eq!(row_count(store.pool()).await, 0);
}

#[tokio::test]
async fn single_store_commit_persists_writes() {
    let store = create_sql_store("accounts").await;
    let coordinator = TransactionCoordinator::new();

    let inserted = coordinator
        .run(&store, |tx| {
            Box::pin(async move {
                let done = sqlx::query(INSERT_ROW)
                    .bind("account")
                    .bind("acct-2")
                    .bind("m-2")
                    .bind("c-2")
                    .execute(&mut **tx)
                    .await?;
                Ok(done.rows_affected())
            })
        })
        .await
        .unwrap();

    assert_eq!(inserted, 1);
    assert_eq!(row_count(store.pool()).await, 1);
}

#[tokio::test]
async fn hybrid_failure_in_second_store_leaves_first_uncommitted() {
    let store_a = create_sql_store("canonical").await;
    let store_b = MemoryTransactionalStore::new("ledger");
    let coordinator = TransactionCoordinator::new();

    let result: Result<((), ()), ServiceError> = coordinator
        .run_hybrid(
            &store_a,
            &store_b,
            |tx| {
                Box::pin(async move {
                    sqlx::query(INSERT_ROW)
                        .bind("subscription")
                        .bind("sub-1")
                        .bind("m-1")
                        .bind("c-1")
                        .execute(&mut **tx)
                        .await?;
                    Ok(())
                })
            },
            |tx| {
                Box::pin(async move {
                    tx.put("sub-1", json!({"state": "active"}));
                    Err(ServiceError::ValidationError("ledger rejected entry".into()))
                })
            },
        )
        .await;

    assert!(matches!(result, Err(ServiceError::ValidationError(_))));
    assert_eq!(row_count(store_a.pool()).await, 0);
    assert!(store_b.snapshot().await.is_empty());
    assert_eq!(store_b.rollback_count(), 1);
}

#[tokio::test]
async fn hybrid_commits_both_stores_in_order() {
    let store_a = MemoryTransactionalStore::new("canonical");
    let store_b = MemoryTransactionalStore::new("mirror");
    let coordinator = TransactionCoordinator::new();

    let (a, b) = coordinator
        .run_hybrid(
            &store_a,
            &store_b,
            |tx| {
                Box::pin(async move {
                    tx.put("user:1", json!({"name": "Ada"}));
                    Ok("a")
                })
            },
            |tx| {
                Box::pin(async move {
                    tx.put("user:1", json!({"name": "Ada"}));
                    Ok("b")
                })
            },
        )
        .await
        .unwrap();

    assert_eq!((a, b), ("a", "b"));
    assert_eq!(store_a.commit_count(), 1);
    assert_eq!(store_b.commit_count(), 1);
}

#[tokio::test]
async fn failed_first_commit_commits_nothing() {
    let store_a = MemoryTransactionalStore::new("canonical");
    let store_b = MemoryTransactionalStore::new("mirror");
    store_a.inject_commit_failure(true);
    let coordinator = TransactionCoordinator::new();

    let err = coordinator
        .run_hybrid(
            &store_a,
            &store_b,
            |tx| {
                Box::pin(async move {
                    tx.put("k", json!(1));
                    Ok(())
                })
            },
            |tx| {
                Box::pin(async move {
                    tx.put("k", json!(2));
                    Ok(())
                })
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ServiceError::TransactionFailed(ref msg) if msg.contains("nothing committed")
    ));
    assert!(store_a.snapshot().await.is_empty());
    assert!(store_b.snapshot().await.is_empty());
    assert_eq!(store_b.rollback_count(), 1);
}

#[tokio::test]
async fn failed_second_commit_reports_partial_commit() {
    let store_a = MemoryTransactionalStore::new("canonical");
    let store_b = MemoryTransactionalStore::new("mirror");
    store_b.inject_commit_failure(true);
    let coordinator = TransactionCoordinator::new();

    let err = coordinator
        .run_hybrid(
            &store_a,
            &store_b,
            |tx| {
                Box::pin(async move {
                    tx.put("k", json!(1));
                    Ok(())
                })
            },
            |tx| {
                Box::pin(async move {
                    tx.put("k", json!(2));
                    Ok(())
                })
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ServiceError::TransactionFailed(ref msg) if msg.contains("partial commit")
    ));
    assert_eq!(store_a.get("k").await, Some(json!(1)));
    assert!(store_b.snapshot().await.is_empty());
}

#[tokio::test]
async fn sql_store_requires_matching_pool_variant() {
    let pool = sqlite_pool().await;
    assert!(matches!(pool, DatabasePool::Sqlite(_)));
    assert!(SqlStore::<sqlx::Postgres>::from_database_pool("pg", &pool).is_none());
}
