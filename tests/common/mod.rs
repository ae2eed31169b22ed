#![allow(dead_code)]

use idempotency_guard::config::CoordinatorConfig;
use idempotency_guard::idempotency::{
    Coordinator, MemoryRecordStore, RecordStatus, TemplateKeyExtractor,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsRequest {
    pub request_id: String,
    pub customer_id: i64,
    pub amount: i64,
}

impl PointsRequest {
    pub fn new(request_id: &str, customer_id: i64, amount: i64) -> Self {
        Self {
            request_id: request_id.to_string(),
            customer_id,
            amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsReceipt {
    pub success: bool,
    pub points: i64,
}

pub fn test_config(max_retries: u32, retry_interval_ms: u64) -> CoordinatorConfig {
    CoordinatorConfig::default().with_retries(max_retries, Duration::from_millis(retry_interval_ms))
}

/// Coordinator over a fresh in-memory table, plus a handle on that table.
pub fn memory_coordinator(
    config: CoordinatorConfig,
) -> (MemoryRecordStore, Coordinator<MemoryRecordStore, TemplateKeyExtractor>) {
    let records = MemoryRecordStore::new();
    let coordinator = Coordinator::new(
        records.clone(),
        TemplateKeyExtractor::new("{request_id}"),
        config,
    )
    .expect("valid coordinator config");
    (records, coordinator)
}

/// Polls until `key` reaches `status`, for outcomes written by background tasks.
pub async fn wait_for_status(records: &MemoryRecordStore, key: &str, status: RecordStatus) -> bool {
    for _ in 0..100 {
        if records.get(key).map(|r| r.status) == Some(status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Connects to the test database, or returns `None` when `DATABASE_URL` is unset.
pub async fn setup_test_db() -> Option<PgPool> {
    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").ok()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    Some(pool)
}

pub fn unique_table(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

pub async fn drop_table(pool: &PgPool, table: &str) {
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
        .execute(pool)
        .await
        .ok();
}
