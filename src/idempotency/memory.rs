use crate::error::StoreError;
use crate::idempotency::record::{IdempotencyRecord, RecordStatus};
use crate::idempotency::storage::{InsertOutcome, RecordStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type Records = Arc<Mutex<HashMap<String, IdempotencyRecord>>>;
type DeferredWrite = Box<dyn FnOnce() + Send>;

/// In-process record table.
///
/// Keeps the same contract as the Postgres table: keys are unique, outcome
/// writes only land on pending records, and nothing written through a
/// [`MemoryTx`] is visible until the transaction commits.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    records: Records,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, IdempotencyRecord>> {
        lock_records(&self.records)
    }

    pub fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        self.lock().get(key).cloned()
    }

    /// Inserts or replaces a record directly, bypassing the protocol.
    pub fn put(&self, record: IdempotencyRecord) {
        self.lock().insert(record.key.clone(), record);
    }

    /// Removes a record directly, bypassing the protocol.
    pub fn remove(&self, key: &str) -> Option<IdempotencyRecord> {
        self.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn lock_records(records: &Records) -> MutexGuard<'_, HashMap<String, IdempotencyRecord>> {
    records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct StagedOutcome {
    key: String,
    status: RecordStatus,
    result: Option<Vec<u8>>,
}

/// Unit of work against a [`MemoryRecordStore`].
///
/// Business writes join the transaction through [`MemoryTx::defer`]; they run
/// only if the transaction commits.
pub struct MemoryTx {
    records: Records,
    staged: Vec<StagedOutcome>,
    deferred: Vec<DeferredWrite>,
}

impl MemoryTx {
    pub fn defer(&mut self, write: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(write));
    }

    pub fn pending_writes(&self) -> usize {
        self.staged.len() + self.deferred.len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    type Tx = MemoryTx;

    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.get(key))
    }

    async fn insert_pending(&self, key: &str) -> Result<InsertOutcome, StoreError> {
        let mut records = self.lock();
        if records.contains_key(key) {
            return Ok(InsertOutcome::Duplicate);
        }
        records.insert(key.to_string(), IdempotencyRecord::pending(key));
        Ok(InsertOutcome::Inserted)
    }

    async fn reset_failed(&self, key: &str) -> Result<bool, StoreError> {
        let mut records = self.lock();
        match records.get_mut(key) {
            Some(record) if record.is_failed() => {
                record.status = RecordStatus::Pending;
                record.result = None;
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(MemoryTx {
            records: Arc::clone(&self.records),
            staged: Vec::new(),
            deferred: Vec::new(),
        })
    }

    async fn write_outcome(
        &self,
        tx: &mut Self::Tx,
        key: &str,
        status: RecordStatus,
        result: Option<&[u8]>,
    ) -> Result<u64, StoreError> {
        let is_pending = self.lock().get(key).map(|r| r.is_pending()).unwrap_or(false);
        if !is_pending {
            return Ok(0);
        }
        tx.staged.push(StagedOutcome {
            key: key.to_string(),
            status,
            result: result.map(<[u8]>::to_vec),
        });
        Ok(1)
    }

    async fn commit_tx(&self, tx: Self::Tx) -> Result<(), StoreError> {
        let MemoryTx {
            records,
            staged,
            deferred,
        } = tx;

        {
            let mut records = lock_records(&records);
            // Validate every staged write before applying any of them.
            if let Some(stale) = staged
                .iter()
                .find(|s| !records.get(&s.key).map(|r| r.is_pending()).unwrap_or(false))
            {
                return Err(StoreError::RecordNotPending(stale.key.clone()));
            }

            let now = Utc::now();
            for write in staged {
                if let Some(record) = records.get_mut(&write.key) {
                    record.status = write.status;
                    record.result = write.result;
                    record.updated_at = now;
                }
            }
        }

        for write in deferred {
            write();
        }
        Ok(())
    }

    async fn rollback_tx(&self, tx: Self::Tx) -> Result<(), StoreError> {
        drop(tx);
        Ok(())
    }

    async fn mark_failed(&self, key: &str) -> Result<u64, StoreError> {
        let mut records = self.lock();
        match records.get_mut(key) {
            Some(record) if record.is_pending() => {
                record.status = RecordStatus::Failed;
                record.result = None;
                record.updated_at = Utc::now();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn ensure_table(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, r| !(r.success() && r.updated_at < cutoff));
        Ok((before - records.len()) as u64)
    }

    async fn count_by_status(&self, status: RecordStatus) -> Result<i64, StoreError> {
        Ok(self.lock().values().filter(|r| r.status == status).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_insert_is_unique() {
        let store = MemoryRecordStore::new();
        assert_eq!(store.insert_pending("k").await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_pending("k").await.unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_only_applies_to_failed() {
        let store = MemoryRecordStore::new();
        store.insert_pending("k").await.unwrap();
        assert!(!store.reset_failed("k").await.unwrap());

        assert_eq!(store.mark_failed("k").await.unwrap(), 1);
        assert!(store.reset_failed("k").await.unwrap());
        assert!(!store.reset_failed("k").await.unwrap());
        assert!(store.get("k").unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_outcome_invisible_until_commit() {
        let store = MemoryRecordStore::new();
        store.insert_pending("k").await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let rows = store
            .write_outcome(&mut tx, "k", RecordStatus::Succeeded, Some(b"42"))
            .await
            .unwrap();
        assert_eq!(rows, 1);
        assert!(store.get("k").unwrap().is_pending());

        store.commit_tx(tx).await.unwrap();
        assert_eq!(store.get("k").unwrap().cached_result(), Some(&b"42"[..]));
    }

    #[tokio::test]
    async fn test_rollback_discards_deferred_writes() {
        let store = MemoryRecordStore::new();
        let counter = Arc::new(AtomicU32::new(0));

        let mut tx = store.begin().await.unwrap();
        let c = Arc::clone(&counter);
        tx.defer(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(tx.pending_writes(), 1);
        store.rollback_tx(tx).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let mut tx = store.begin().await.unwrap();
        let c = Arc::clone(&counter);
        tx.defer(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        store.commit_tx(tx).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_commit_fails_when_record_vanished() {
        let store = MemoryRecordStore::new();
        let counter = Arc::new(AtomicU32::new(0));
        store.insert_pending("k").await.unwrap();

        let mut tx = store.begin().await.unwrap();
        store
            .write_outcome(&mut tx, "k", RecordStatus::Failed, None)
            .await
            .unwrap();
        let c = Arc::clone(&counter);
        tx.defer(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        store.remove("k");

        let err = store.commit_tx(tx).await.unwrap_err();
        assert!(matches!(err, StoreError::RecordNotPending(ref k) if k == "k"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_write_outcome_on_missing_record_affects_nothing() {
        let store = MemoryRecordStore::new();
        let mut tx = store.begin().await.unwrap();
        let rows = store
            .write_outcome(&mut tx, "missing", RecordStatus::Failed, None)
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert_eq!(tx.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_purge_keeps_pending_and_failed() {
        let store = MemoryRecordStore::new();
        let mut done = IdempotencyRecord::pending("done");
        done.status = RecordStatus::Succeeded;
        done.result = Some(b"1".to_vec());
        store.put(done);
        store.insert_pending("busy").await.unwrap();
        store.insert_pending("broken").await.unwrap();
        store.mark_failed("broken").await.unwrap();

        let purged = store
            .purge_succeeded_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get("done").is_none());
        assert_eq!(store.count_by_status(RecordStatus::Pending).await.unwrap(), 1);
        assert_eq!(store.count_by_status(RecordStatus::Failed).await.unwrap(), 1);
    }

    #[test]
    fn test_clones_share_one_table() {
        let store = MemoryRecordStore::new();
        let other = store.clone();

        tokio_test::block_on(async {
            tokio_test::assert_ok!(store.insert_pending("shared").await);
            assert_eq!(
                other.insert_pending("shared").await.unwrap(),
                InsertOutcome::Duplicate
            );
        });
        assert_eq!(other.len(), 1);
    }
}
