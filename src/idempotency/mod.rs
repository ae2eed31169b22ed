pub mod codec;
pub mod handler;
pub mod key_generator;
pub mod memory;
pub mod protocol;
pub mod record;
pub mod storage;

pub use codec::{AlwaysSuccess, JsonSerializer, ResultPolicy, Serializer, SuccessPredicate};
pub use handler::{Coordinator, IdempotencyMetrics, MetricsSnapshot, RetentionJob};
pub use key_generator::{
    hash_key, CompiledTemplate, HashedKeyExtractor, Invocation, KeyExtractor, TemplateKeyExtractor,
};
pub use memory::{MemoryRecordStore, MemoryTx};
pub use protocol::{AcquireOutcome, IdempotencyStore};
pub use record::{IdempotencyRecord, RecordStatus, MAX_KEY_LEN};
pub use storage::{InsertOutcome, PostgresRecordStore, RecordStore};
