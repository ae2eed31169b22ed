mod common;

use common::{drop_table, setup_test_db, test_config, unique_table, PointsReceipt, PointsRequest};
use idempotency_guard::error::{IdempotencyError, StoreError};
use idempotency_guard::idempotency::{
    Coordinator, InsertOutcome, Invocation, PostgresRecordStore, RecordStatus, RecordStore,
    TemplateKeyExtractor,
};
use sqlx::PgPool;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

type PgCoordinator = Coordinator<PostgresRecordStore, TemplateKeyExtractor>;

async fn pg_coordinator(pool: &PgPool, table: &str) -> PgCoordinator {
    let config = test_config(100, 20).with_table_name(table);
    let records = PostgresRecordStore::from_config(pool.clone(), &config).expect("valid table name");
    records.ensure_table().await.expect("Failed to create record table");
    Coordinator::new(records, TemplateKeyExtractor::new("{request_id}"), config)
        .expect("valid coordinator config")
}

async fn create_points_table(pool: &PgPool, table: &str) {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (customer_id BIGINT PRIMARY KEY, points BIGINT NOT NULL)",
        table
    ))
    .execute(pool)
    .await
    .expect("Failed to create points table");
}

async fn points_of(pool: &PgPool, table: &str, customer_id: i64) -> i64 {
    let row: Option<(i64,)> = sqlx::query_as(&format!(
        "SELECT points FROM {} WHERE customer_id = $1",
        table
    ))
    .bind(customer_id)
    .fetch_optional(pool)
    .await
    .expect("Failed to read points");
    row.map(|(p,)| p).unwrap_or(0)
}

fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (customer_id, points) VALUES ($1, $2) \
         ON CONFLICT (customer_id) DO UPDATE SET points = {table}.points + EXCLUDED.points \
         RETURNING points"
    )
}

#[tokio::test]
async fn test_record_store_primitives() {
    let Some(pool) = setup_test_db().await else {
        return;
    };
    let table = unique_table("idem_primitives");
    let store = PostgresRecordStore::new(pool.clone(), table.as_str()).unwrap();
    store.ensure_table().await.unwrap();
    // Idempotent DDL.
    store.ensure_table().await.unwrap();

    assert!(store.find("k1").await.unwrap().is_none());
    assert_eq!(store.insert_pending("k1").await.unwrap(), InsertOutcome::Inserted);
    assert_eq!(store.insert_pending("k1").await.unwrap(), InsertOutcome::Duplicate);

    let record = store.find("k1").await.unwrap().unwrap();
    assert!(record.is_pending());
    assert!(!store.reset_failed("k1").await.unwrap());

    let mut tx = store.begin().await.unwrap();
    let rows = store
        .write_outcome(&mut tx, "k1", RecordStatus::Succeeded, Some(b"{\"n\":1}"))
        .await
        .unwrap();
    assert_eq!(rows, 1);
    store.commit_tx(tx).await.unwrap();

    let record = store.find("k1").await.unwrap().unwrap();
    assert!(record.success());
    assert_eq!(record.cached_result(), Some(&b"{\"n\":1}"[..]));
    assert_eq!(store.mark_failed("k1").await.unwrap(), 0);

    store.insert_pending("k2").await.unwrap();
    assert_eq!(store.mark_failed("k2").await.unwrap(), 1);
    assert!(store.reset_failed("k2").await.unwrap());
    assert!(!store.reset_failed("k2").await.unwrap());

    assert_eq!(store.count_by_status(RecordStatus::Succeeded).await.unwrap(), 1);
    assert_eq!(store.count_by_status(RecordStatus::Pending).await.unwrap(), 1);

    let purged = store
        .purge_succeeded_before(chrono::Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(store.find("k1").await.unwrap().is_none());

    drop_table(&pool, &table).await;
}

#[tokio::test]
async fn test_rolled_back_outcome_leaves_record_pending() {
    let Some(pool) = setup_test_db().await else {
        return;
    };
    let table = unique_table("idem_rollback");
    let store = PostgresRecordStore::new(pool.clone(), table.as_str()).unwrap();
    store.ensure_table().await.unwrap();
    store.insert_pending("k").await.unwrap();

    let mut tx = store.begin().await.unwrap();
    store
        .write_outcome(&mut tx, "k", RecordStatus::Failed, None)
        .await
        .unwrap();
    store.rollback_tx(tx).await.unwrap();

    assert!(store.find("k").await.unwrap().unwrap().is_pending());

    drop_table(&pool, &table).await;
}

#[tokio::test]
async fn test_concurrent_invocations_apply_business_write_once() {
    let Some(pool) = setup_test_db().await else {
        return;
    };
    let table = unique_table("idem_concurrent");
    let points_table = unique_table("points_concurrent");
    create_points_table(&pool, &points_table).await;
    let coordinator = Arc::new(pg_coordinator(&pool, &table).await);
    let calls = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let calls = Arc::clone(&calls);
            let sql = upsert_sql(&points_table);
            tokio::spawn(async move {
                let invocation = Invocation::new("increase_points", PointsRequest::new("req-42", 7, 3));
                let result = coordinator
                    .invoke(&invocation, move |inv, tx| {
                        Box::pin(async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            let (points,): (i64,) = sqlx::query_as(&sql)
                                .bind(inv.args.customer_id)
                                .bind(inv.args.amount)
                                .fetch_one(&mut **tx)
                                .await?;
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, anyhow::Error>(PointsReceipt {
                                success: true,
                                points,
                            })
                        })
                    })
                    .await;
                result
            })
        })
        .collect();

    let mut receipts = Vec::new();
    for handle in handles {
        receipts.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(receipts.iter().all(|r| r.points == 3));
    assert_eq!(points_of(&pool, &points_table, 7).await, 3);

    drop_table(&pool, &table).await;
    drop_table(&pool, &points_table).await;
}

#[tokio::test]
async fn test_failed_operation_rolls_back_and_retries() {
    let Some(pool) = setup_test_db().await else {
        return;
    };
    let table = unique_table("idem_retry");
    let points_table = unique_table("points_retry");
    create_points_table(&pool, &points_table).await;
    let coordinator = pg_coordinator(&pool, &table).await;
    let invocation = Invocation::new("increase_points", PointsRequest::new("req-retry", 1, 10));
    let sql = upsert_sql(&points_table);

    let first_sql = sql.clone();
    let err = coordinator
        .invoke(&invocation, move |inv, tx| {
            Box::pin(async move {
                sqlx::query(&first_sql)
                    .bind(inv.args.customer_id)
                    .bind(inv.args.amount)
                    .execute(&mut **tx)
                    .await?;
                Err::<PointsReceipt, _>(anyhow::anyhow!("ledger rejected the entry"))
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, IdempotencyError::Operation(_)));
    assert_eq!(points_of(&pool, &points_table, 1).await, 0);
    assert!(coordinator
        .records()
        .find("req-retry")
        .await
        .unwrap()
        .unwrap()
        .is_failed());

    let receipt = coordinator
        .invoke(&invocation, move |inv, tx| {
            Box::pin(async move {
                let (points,): (i64,) = sqlx::query_as(&sql)
                    .bind(inv.args.customer_id)
                    .bind(inv.args.amount)
                    .fetch_one(&mut **tx)
                    .await?;
                Ok::<_, anyhow::Error>(PointsReceipt {
                    success: true,
                    points,
                })
            })
        })
        .await
        .unwrap();
    assert_eq!(receipt.points, 10);
    assert_eq!(points_of(&pool, &points_table, 1).await, 10);

    drop_table(&pool, &table).await;
    drop_table(&pool, &points_table).await;
}

#[tokio::test]
async fn test_commit_failure_rolls_back_business_write() {
    let Some(pool) = setup_test_db().await else {
        return;
    };
    let table = unique_table("idem_commit");
    let points_table = unique_table("points_commit");
    create_points_table(&pool, &points_table).await;
    let coordinator = pg_coordinator(&pool, &table).await;
    let invocation = Invocation::new("increase_points", PointsRequest::new("req-vanish", 2, 5));
    let sql = upsert_sql(&points_table);
    let delete_sql = format!("DELETE FROM {} WHERE idempotency_key = $1", table);
    let side_pool = pool.clone();

    let err = coordinator
        .invoke(&invocation, move |inv, tx| {
            Box::pin(async move {
                let (points,): (i64,) = sqlx::query_as(&sql)
                    .bind(inv.args.customer_id)
                    .bind(inv.args.amount)
                    .fetch_one(&mut **tx)
                    .await?;
                // Someone else removes the lock record while the operation runs.
                sqlx::query(&delete_sql)
                    .bind(&inv.args.request_id)
                    .execute(&side_pool)
                    .await?;
                Ok::<_, anyhow::Error>(PointsReceipt {
                    success: true,
                    points,
                })
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        IdempotencyError::Commit {
            source: StoreError::RecordNotPending(_),
            ..
        }
    ));
    assert_eq!(points_of(&pool, &points_table, 2).await, 0);

    drop_table(&pool, &table).await;
    drop_table(&pool, &points_table).await;
}
