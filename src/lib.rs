pub mod config;
pub mod error;
pub mod idempotency;
pub mod observability;

pub use config::{CoordinatorConfig, Settings};
pub use error::{IdempotencyError, Result, StoreError};
pub use idempotency::{
    AcquireOutcome, Coordinator, IdempotencyRecord, IdempotencyStore, Invocation, KeyExtractor,
    MemoryRecordStore, MemoryTx, PostgresRecordStore, RecordStatus, RecordStore, ResultPolicy,
    TemplateKeyExtractor,
};
