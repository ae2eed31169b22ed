use idempotency_guard::config::Settings;
use idempotency_guard::idempotency::{
    Coordinator, Invocation, PostgresRecordStore, RecordStore, ResultPolicy, TemplateKeyExtractor,
};
use idempotency_guard::observability::{init_logging, init_metrics, LogConfig};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IncreasePoints {
    request_id: String,
    customer_id: i64,
    amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PointsReceipt {
    success: bool,
    points: i64,
}

async fn increase_points(
    invocation: &Invocation<IncreasePoints>,
    tx: &mut Transaction<'static, Postgres>,
) -> anyhow::Result<PointsReceipt> {
    let request = &invocation.args;
    let (points,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO customer_points (customer_id, points)
        VALUES ($1, $2)
        ON CONFLICT (customer_id) DO UPDATE SET points = customer_points.points + EXCLUDED.points
        RETURNING points
        "#,
    )
    .bind(request.customer_id)
    .bind(request.amount)
    .fetch_one(&mut **tx)
    .await?;

    // Give the concurrent caller time to start polling.
    tokio::time::sleep(Duration::from_millis(500)).await;

    Ok(PointsReceipt {
        success: true,
        points,
    })
}

async fn current_points(pool: &PgPool, customer_id: i64) -> Result<i64, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT points FROM customer_points WHERE customer_id = $1")
        .bind(customer_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(points,)| points).unwrap_or(0))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let settings = Settings::new()?;
    init_logging(&LogConfig::from(&settings.logging));
    let prometheus = init_metrics()?;
    info!("Configuration loaded");

    info!("Connecting to database at {}...", settings.database.url);
    let pool = PgPoolOptions::new()
        .max_connections(settings.database.pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&settings.database.url)
        .await?;
    info!("Database connection established");

    let config = settings.idempotency.validated()?;
    let records = PostgresRecordStore::from_config(pool.clone(), &config)?;
    records.ensure_table().await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS customer_points (
            customer_id BIGINT NOT NULL PRIMARY KEY,
            points BIGINT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    let extractor = TemplateKeyExtractor::new("{request_id}");
    let coordinator = Arc::new(Coordinator::new(records, extractor, config)?);

    let request_id = std::env::args().nth(1).unwrap_or_else(|| "req-42".to_string());
    let invocation = Arc::new(Invocation::new(
        "increase_points",
        IncreasePoints {
            request_id,
            customer_id: 7,
            amount: 3,
        },
    ));

    let before = current_points(&pool, 7).await?;

    let callers: Vec<_> = (0..2)
        .map(|caller| {
            let coordinator = Arc::clone(&coordinator);
            let invocation = Arc::clone(&invocation);
            tokio::spawn(async move {
                let policy = ResultPolicy::new().with_predicate(|r: &PointsReceipt| r.success);
                let outcome = coordinator
                    .invoke_with(invocation.as_ref(), &policy, |inv, tx| {
                        Box::pin(increase_points(inv, tx))
                    })
                    .await;
                match &outcome {
                    Ok(receipt) => info!(caller, points = receipt.points, "Caller finished"),
                    Err(e) => error!(caller, error = %e, "Caller failed"),
                }
                outcome
            })
        })
        .collect();

    for caller in callers {
        caller.await??;
    }

    let after = current_points(&pool, 7).await?;
    info!(
        before,
        after,
        delta = after - before,
        "Two concurrent calls with one idempotency key applied once"
    );
    info!(snapshot = ?coordinator.metrics().snapshot(), "Coordinator metrics");
    info!("Prometheus metrics:\n{}", prometheus.render());

    Ok(())
}
