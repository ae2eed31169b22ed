use crate::config::CoordinatorConfig;
use crate::error::{IdempotencyError, Result, StoreError};
use crate::idempotency::record::RecordStatus;
use crate::idempotency::storage::{InsertOutcome, RecordStore};
use crate::observability::mask_key;
use tracing::{debug, error, info};

/// What a caller may do after [`IdempotencyStore::acquire_or_wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller holds the lock and must commit an outcome.
    Proceed,
    /// A previous invocation succeeded; these are its stored result bytes.
    Cached(Vec<u8>),
}

/// Lock/poll/commit protocol on top of a [`RecordStore`].
pub struct IdempotencyStore<S> {
    records: S,
    config: CoordinatorConfig,
}

impl<S: RecordStore> IdempotencyStore<S> {
    pub fn new(records: S, config: CoordinatorConfig) -> Self {
        Self { records, config }
    }

    pub fn records(&self) -> &S {
        &self.records
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Takes the lock for `key` or returns the result of the invocation that
    /// already succeeded under it.
    ///
    /// Polls an in-flight record every `retry_interval`, at most
    /// `max_retries` times, then fails with [`IdempotencyError::LockTimeout`].
    pub async fn acquire_or_wait(&self, key: &str) -> Result<AcquireOutcome> {
        let max_retries = self.config.max_retries;
        let mut attempts = 0;

        while attempts < max_retries {
            attempts += 1;

            let record = match self.records.find(key).await? {
                Some(record) => record,
                None => match self.records.insert_pending(key).await? {
                    InsertOutcome::Inserted => {
                        debug!(key = %mask_key(key), "First invocation, lock acquired");
                        return Ok(AcquireOutcome::Proceed);
                    }
                    InsertOutcome::Duplicate => {
                        // Lost the insert race; the winner's record exists now.
                        debug!(key = %mask_key(key), attempts, "Concurrent insert detected, re-reading");
                        continue;
                    }
                },
            };

            match record.status {
                RecordStatus::Succeeded => {
                    let result = record.cached_result().ok_or_else(|| StoreError::CorruptRecord {
                        key: key.to_string(),
                        reason: "succeeded record has no result".to_string(),
                    })?;
                    debug!(key = %mask_key(key), "Previous invocation succeeded, replaying result");
                    return Ok(AcquireOutcome::Cached(result.to_vec()));
                }
                RecordStatus::Failed => {
                    if self.records.reset_failed(key).await? {
                        info!(key = %mask_key(key), "Previous invocation failed, retrying");
                        return Ok(AcquireOutcome::Proceed);
                    }
                    debug!(key = %mask_key(key), "Failed record was reset by another caller");
                }
                RecordStatus::Pending => {
                    info!(
                        key = %mask_key(key),
                        attempts,
                        "Previous invocation has not returned yet, waiting"
                    );
                    if attempts < max_retries {
                        tokio::time::sleep(self.config.retry_interval).await;
                    }
                }
            }
        }

        error!(key = %mask_key(key), attempts, "Timed out waiting for previous invocation");
        Err(IdempotencyError::LockTimeout {
            key: key.to_string(),
            attempts,
        })
    }

    /// Records the terminal outcome of the lock holder inside `tx`.
    ///
    /// A successful outcome must carry a non-empty result; a failed one
    /// stores none. Zero affected rows means the record is gone or no longer
    /// pending, which is reported rather than ignored.
    pub async fn commit(
        &self,
        tx: &mut S::Tx,
        key: &str,
        result: Option<&[u8]>,
        success: bool,
    ) -> std::result::Result<(), StoreError> {
        let (status, result) = if success {
            match result {
                Some(bytes) if !bytes.is_empty() => (RecordStatus::Succeeded, Some(bytes)),
                _ => {
                    return Err(StoreError::CorruptRecord {
                        key: key.to_string(),
                        reason: "successful outcome without result".to_string(),
                    })
                }
            }
        } else {
            (RecordStatus::Failed, None)
        };

        if let Some(bytes) = result {
            if bytes.len() > self.config.max_result_bytes {
                return Err(StoreError::ResultTooLarge {
                    key: key.to_string(),
                    size: bytes.len(),
                    limit: self.config.max_result_bytes,
                });
            }
        }

        let rows = self.records.write_outcome(tx, key, status, result).await?;
        if rows != 1 {
            return Err(StoreError::RecordNotPending(key.to_string()));
        }
        Ok(())
    }

    /// Marks the holder's pending record failed outside any transaction, so
    /// the next caller retries instead of waiting out the lock.
    pub async fn release(&self, key: &str) -> std::result::Result<(), StoreError> {
        let rows = self.records.mark_failed(key).await?;
        if rows != 1 {
            return Err(StoreError::Release {
                key: key.to_string(),
                reason: "record is not pending".to_string(),
            });
        }
        Ok(())
    }

    pub async fn begin(&self) -> std::result::Result<S::Tx, StoreError> {
        self.records.begin().await
    }

    pub async fn finish(&self, tx: S::Tx) -> std::result::Result<(), StoreError> {
        self.records.commit_tx(tx).await
    }

    pub async fn abort(&self, tx: S::Tx) -> std::result::Result<(), StoreError> {
        self.records.rollback_tx(tx).await
    }
}
