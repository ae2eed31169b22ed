use crate::config::CoordinatorConfig;
use crate::error::{IdempotencyError, Result, StoreError};
use crate::idempotency::codec::{ResultPolicy, Serializer, SuccessPredicate};
use crate::idempotency::key_generator::KeyExtractor;
use crate::idempotency::protocol::{AcquireOutcome, IdempotencyStore};
use crate::idempotency::record::MAX_KEY_LEN;
use crate::idempotency::storage::RecordStore;
use crate::observability::{get_metrics, mask_key, LatencyTimer};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-coordinator counters.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub executed_requests: AtomicU64,
    pub succeeded_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub lock_timeouts: AtomicU64,
    pub commit_failures: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_invocation();
    }

    pub fn record_replay(&self) {
        self.replayed_requests.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_replay();
    }

    pub fn record_executed(&self) {
        self.executed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded_requests.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_execution(true);
    }

    pub fn record_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_execution(false);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_lock_timeout();
    }

    pub fn record_commit_failure(&self, reason: &str) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_commit_failure(reason);
    }

    pub fn replay_rate(&self) -> f64 {
        self.snapshot().replay_rate()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            executed_requests: self.executed_requests.load(Ordering::Relaxed),
            succeeded_requests: self.succeeded_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub replayed_requests: u64,
    pub executed_requests: u64,
    pub succeeded_requests: u64,
    pub failed_requests: u64,
    pub lock_timeouts: u64,
    pub commit_failures: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Releases a held key if the invocation ends without recording an outcome,
/// e.g. the future is dropped or the operation panics.
struct LockGuard<S: RecordStore> {
    store: Arc<IdempotencyStore<S>>,
    key: String,
    armed: bool,
}

impl<S: RecordStore> LockGuard<S> {
    fn new(store: Arc<IdempotencyStore<S>>, key: String) -> Self {
        Self {
            store,
            key,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<S: RecordStore> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let key = std::mem::take(&mut self.key);
        warn!(key = %mask_key(&key), "Invocation abandoned before recording an outcome, releasing lock");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    if let Err(e) = store.release(&key).await {
                        error!(key = %mask_key(&key), error = %e, "Failed to release abandoned lock");
                    }
                });
            }
            Err(_) => {
                error!(key = %mask_key(&key), "No runtime to release abandoned lock");
            }
        }
    }
}

/// Runs operations at most once per idempotency key.
///
/// The operation receives the store transaction; anything it writes through
/// that transaction commits together with the stored outcome, or not at all.
pub struct Coordinator<S: RecordStore, K> {
    store: Arc<IdempotencyStore<S>>,
    extractor: K,
    metrics: Arc<IdempotencyMetrics>,
}

impl<S: RecordStore, K> Coordinator<S, K> {
    pub fn new(records: S, extractor: K, config: CoordinatorConfig) -> Result<Self> {
        let config = config.validated()?;
        if let Some(table) = records.bound_table() {
            if table != config.table_name {
                return Err(IdempotencyError::Config(format!(
                    "store is bound to table '{}' but configuration names '{}'",
                    table, config.table_name
                )));
            }
        }
        Ok(Self {
            store: Arc::new(IdempotencyStore::new(records, config)),
            extractor,
            metrics: Arc::new(IdempotencyMetrics::new()),
        })
    }

    pub fn store(&self) -> &Arc<IdempotencyStore<S>> {
        &self.store
    }

    pub fn records(&self) -> &S {
        self.store.records()
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn retention_job(&self, retention: chrono::Duration, interval: std::time::Duration) -> RetentionJob<S> {
        RetentionJob::new(Arc::clone(&self.store), retention, interval)
    }

    fn extract_key<C>(&self, context: &C) -> Result<String>
    where
        K: KeyExtractor<C>,
    {
        match self.extractor.extract(context) {
            Some(key) if key.is_empty() => Err(IdempotencyError::KeyExtraction(
                "derived idempotency key is empty".to_string(),
            )),
            Some(key) if key.len() > MAX_KEY_LEN => Err(IdempotencyError::KeyExtraction(format!(
                "derived idempotency key is {} bytes, limit is {}",
                key.len(),
                MAX_KEY_LEN
            ))),
            Some(key) => Ok(key),
            None => Err(IdempotencyError::KeyExtraction(
                "no idempotency key could be derived from the invocation".to_string(),
            )),
        }
    }

    /// Runs `operation` once for the key derived from `context`, storing its
    /// result as JSON. Every result counts as a success.
    pub async fn invoke<C, T, F>(&self, context: &C, operation: F) -> Result<T>
    where
        C: Sync,
        K: KeyExtractor<C>,
        T: Serialize + DeserializeOwned + Send,
        F: for<'a> FnOnce(&'a C, &'a mut S::Tx) -> BoxFuture<'a, anyhow::Result<T>> + Send,
    {
        let policy = ResultPolicy::new();
        self.invoke_with(context, &policy, operation).await
    }

    /// Like [`Coordinator::invoke`] with an explicit serializer and success
    /// predicate. Results the predicate rejects are recorded as failures and
    /// returned to the caller unchanged.
    pub async fn invoke_with<C, T, Z, P, F>(
        &self,
        context: &C,
        policy: &ResultPolicy<Z, P>,
        operation: F,
    ) -> Result<T>
    where
        C: Sync,
        K: KeyExtractor<C>,
        T: Send,
        Z: Serializer<T>,
        P: SuccessPredicate<T>,
        F: for<'a> FnOnce(&'a C, &'a mut S::Tx) -> BoxFuture<'a, anyhow::Result<T>> + Send,
    {
        let key = self.extract_key(context)?;
        self.metrics.record_request();

        let timer = LatencyTimer::new();
        match self.store.acquire_or_wait(&key).await {
            Ok(AcquireOutcome::Cached(bytes)) => {
                get_metrics().record_acquire_latency(timer.elapsed_ms(), true);
                self.metrics.record_replay();
                info!(key = %mask_key(&key), "Repeat invocation found, returning previous result");
                return policy.serializer.deserialize(&bytes);
            }
            Ok(AcquireOutcome::Proceed) => {
                get_metrics().record_acquire_latency(timer.elapsed_ms(), false);
            }
            Err(e) => {
                if matches!(e, IdempotencyError::LockTimeout { .. }) {
                    self.metrics.record_lock_timeout();
                }
                return Err(e);
            }
        }

        let mut guard = LockGuard::new(Arc::clone(&self.store), key.clone());
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                self.release(&key, &mut guard).await?;
                return Err(IdempotencyError::Store(e));
            }
        };

        self.metrics.record_executed();
        let outcome = operation(context, &mut tx).await;

        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                info!(key = %mask_key(&key), error = %err, "Operation failed, recording failure");
                // The operation's writes are discarded with the transaction.
                self.discard(tx, &key).await;
                self.release(&key, &mut guard).await?;
                self.metrics.record_failed();
                return Err(IdempotencyError::Operation(err));
            }
        };

        let success = policy.predicate.is_success(&value);
        let bytes = if success {
            match policy.serializer.serialize(&value) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    error!(key = %mask_key(&key), error = %e, "Unable to serialize result");
                    self.discard(tx, &key).await;
                    self.release(&key, &mut guard).await?;
                    self.metrics.record_failed();
                    return Err(e);
                }
            }
        } else {
            None
        };

        if let Err(source) = self.persist(tx, &key, bytes.as_deref(), success).await {
            guard.disarm();
            self.metrics.record_commit_failure("commit");
            error!(key = %mask_key(&key), error = %source, "Failed to commit outcome");
            if let Err(e) = self.store.release(&key).await {
                warn!(key = %mask_key(&key), error = %e, "Failed to release lock after commit failure");
            }
            return Err(IdempotencyError::Commit { key, source });
        }
        guard.disarm();

        if success {
            self.metrics.record_succeeded();
            debug!(key = %mask_key(&key), "Invocation succeeded, result stored");
        } else {
            self.metrics.record_failed();
            info!(key = %mask_key(&key), "Result classified as failure, next invocation will retry");
        }
        Ok(value)
    }

    /// Writes the outcome inside `tx` and commits it.
    async fn persist(
        &self,
        mut tx: S::Tx,
        key: &str,
        bytes: Option<&[u8]>,
        success: bool,
    ) -> std::result::Result<(), StoreError> {
        if let Err(e) = self.store.commit(&mut tx, key, bytes, success).await {
            self.discard(tx, key).await;
            return Err(e);
        }
        self.store.finish(tx).await
    }

    async fn discard(&self, tx: S::Tx, key: &str) {
        if let Err(e) = self.store.abort(tx).await {
            warn!(key = %mask_key(key), error = %e, "Failed to roll back transaction");
        }
    }

    /// Marks the held key failed. A failure here outranks whatever error
    /// led to it, since the record would otherwise stay pending.
    async fn release(&self, key: &str, guard: &mut LockGuard<S>) -> Result<()> {
        guard.disarm();
        self.store.release(key).await.map_err(|source| {
            self.metrics.record_commit_failure("release");
            error!(key = %mask_key(key), error = %source, "Failed to release lock");
            IdempotencyError::Commit {
                key: key.to_string(),
                source,
            }
        })
    }
}

/// Background purge of old succeeded records.
pub struct RetentionJob<S: RecordStore> {
    store: Arc<IdempotencyStore<S>>,
    retention: chrono::Duration,
    interval: std::time::Duration,
}

impl<S: RecordStore> RetentionJob<S> {
    pub fn new(
        store: Arc<IdempotencyStore<S>>,
        retention: chrono::Duration,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    /// Runs the purge once.
    pub async fn run_once(&self) -> std::result::Result<u64, StoreError> {
        let cutoff = chrono::Utc::now() - self.retention;
        let count = self.store.records().purge_succeeded_before(cutoff).await?;
        get_metrics().record_purged(count);
        Ok(count)
    }

    /// Starts the purge in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(count) => {
                        if count > 0 {
                            info!("Purged {} expired idempotency records", count);
                        }
                    }
                    Err(e) => {
                        error!("Failed to purge expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}
