use crate::config::{check_table_name, CoordinatorConfig};
use crate::error::{Result as GuardResult, StoreError};
use crate::idempotency::record::{IdempotencyRecord, RecordRow, RecordStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

/// Result of trying to insert a fresh pending record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The caller now holds the lock for the key.
    Inserted,
    /// Another caller inserted the key first.
    Duplicate,
}

/// Row-level access to the idempotency table.
///
/// Every method except [`RecordStore::write_outcome`] runs in its own
/// autocommitted statement so pollers on other connections observe it at once.
/// `write_outcome` runs inside the transaction the operation writes its own
/// data through, so both commit or roll back together.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    type Tx: Send;

    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    async fn insert_pending(&self, key: &str) -> Result<InsertOutcome, StoreError>;

    /// Flips a failed record back to pending. Returns false if the record was
    /// not failed anymore (another caller reset it first).
    async fn reset_failed(&self, key: &str) -> Result<bool, StoreError>;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Writes a terminal outcome for a pending record. Returns rows affected.
    async fn write_outcome(
        &self,
        tx: &mut Self::Tx,
        key: &str,
        status: RecordStatus,
        result: Option<&[u8]>,
    ) -> Result<u64, StoreError>;

    async fn commit_tx(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn rollback_tx(&self, tx: Self::Tx) -> Result<(), StoreError>;

    /// Marks a pending record failed outside any transaction. Returns rows affected.
    async fn mark_failed(&self, key: &str) -> Result<u64, StoreError>;

    async fn ensure_table(&self) -> Result<(), StoreError>;

    /// Deletes succeeded records last touched before `cutoff`.
    async fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn count_by_status(&self, status: RecordStatus) -> Result<i64, StoreError>;

    /// Name of the table this store is bound to, if it has one. The
    /// coordinator refuses a configuration naming a different table.
    fn bound_table(&self) -> Option<&str> {
        None
    }
}

struct Statements {
    create: String,
    select: String,
    insert: String,
    reset: String,
    write_outcome: String,
    mark_failed: String,
    purge: String,
    count: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            create: format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    idempotency_key VARCHAR(255) NOT NULL PRIMARY KEY,
                    status VARCHAR(16) NOT NULL DEFAULT 'PENDING',
                    success BOOLEAN NOT NULL DEFAULT FALSE,
                    result BYTEA,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    CHECK (success = (status = 'SUCCEEDED'))
                )
                "#
            ),
            select: format!(
                r#"
                SELECT idempotency_key, status, success, result, created_at, updated_at
                FROM {table}
                WHERE idempotency_key = $1
                "#
            ),
            insert: format!(
                r#"
                INSERT INTO {table} (idempotency_key, status, success, result, created_at, updated_at)
                VALUES ($1, 'PENDING', FALSE, NULL, NOW(), NOW())
                "#
            ),
            reset: format!(
                r#"
                UPDATE {table}
                SET status = 'PENDING', success = FALSE, result = NULL, updated_at = NOW()
                WHERE idempotency_key = $1 AND status = 'FAILED'
                "#
            ),
            write_outcome: format!(
                r#"
                UPDATE {table}
                SET status = $2, success = $3, result = $4, updated_at = NOW()
                WHERE idempotency_key = $1 AND status = 'PENDING'
                "#
            ),
            mark_failed: format!(
                r#"
                UPDATE {table}
                SET status = 'FAILED', success = FALSE, result = NULL, updated_at = NOW()
                WHERE idempotency_key = $1 AND status = 'PENDING'
                "#
            ),
            purge: format!(
                r#"
                DELETE FROM {table}
                WHERE status = 'SUCCEEDED' AND updated_at < $1
                "#
            ),
            count: format!(
                r#"
                SELECT COUNT(*) FROM {table} WHERE status = $1
                "#
            ),
        }
    }
}

/// PostgreSQL-backed record table.
pub struct PostgresRecordStore {
    pool: PgPool,
    table_name: String,
    sql: Statements,
}

impl PostgresRecordStore {
    /// Fails with a config error unless `table_name` is a plain or
    /// schema-qualified identifier, since it is spliced into SQL text.
    pub fn new(pool: PgPool, table_name: impl Into<String>) -> GuardResult<Self> {
        let table_name = table_name.into();
        check_table_name(&table_name)?;
        let sql = Statements::for_table(&table_name);
        Ok(Self {
            pool,
            table_name,
            sql,
        })
    }

    /// Store on the table named by a validated `config`.
    pub fn from_config(pool: PgPool, config: &CoordinatorConfig) -> GuardResult<Self> {
        let config = config.clone().validated()?;
        Self::new(pool, config.table_name)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    type Tx = Transaction<'static, Postgres>;

    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>(&self.sql.select)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RecordRow::into_record).transpose()
    }

    async fn insert_pending(&self, key: &str) -> Result<InsertOutcome, StoreError> {
        let inserted = sqlx::query(&self.sql.insert)
            .bind(key)
            .execute(&self.pool)
            .await;

        match inserted {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    async fn reset_failed(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(&self.sql.reset)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(self.pool.begin().await?)
    }

    async fn write_outcome(
        &self,
        tx: &mut Self::Tx,
        key: &str,
        status: RecordStatus,
        result: Option<&[u8]>,
    ) -> Result<u64, StoreError> {
        let done = sqlx::query(&self.sql.write_outcome)
            .bind(key)
            .bind(status.as_str())
            .bind(status == RecordStatus::Succeeded)
            .bind(result)
            .execute(&mut **tx)
            .await?;

        Ok(done.rows_affected())
    }

    async fn commit_tx(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback_tx(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.rollback().await?;
        Ok(())
    }

    async fn mark_failed(&self, key: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(&self.sql.mark_failed)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn ensure_table(&self) -> Result<(), StoreError> {
        tracing::info!(table = %self.table_name, "Ensuring idempotency table exists");
        sqlx::query(&self.sql.create).execute(&self.pool).await?;
        Ok(())
    }

    async fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(&self.sql.purge)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, status: RecordStatus) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(&self.sql.count)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0)
    }

    fn bound_table(&self) -> Option<&str> {
        Some(&self.table_name)
    }
}
