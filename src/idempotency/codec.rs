use crate::error::{IdempotencyError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts operation results to and from the bytes stored in the record.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<T: Serialize + DeserializeOwned> Serializer<T> for JsonSerializer {
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| {
            IdempotencyError::Serialization(format!("Failed to serialize result: {}", e))
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            IdempotencyError::Serialization(format!("Failed to deserialize cached result: {}", e))
        })
    }
}

/// Decides whether a returned value counts as a success worth caching.
pub trait SuccessPredicate<T>: Send + Sync {
    fn is_success(&self, value: &T) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSuccess;

impl<T> SuccessPredicate<T> for AlwaysSuccess {
    fn is_success(&self, _value: &T) -> bool {
        true
    }
}

impl<T, F> SuccessPredicate<T> for F
where
    F: Fn(&T) -> bool + Send + Sync,
{
    fn is_success(&self, value: &T) -> bool {
        self(value)
    }
}

/// Per-operation result handling: how to store a value and whether to keep it.
#[derive(Debug, Clone, Default)]
pub struct ResultPolicy<Z = JsonSerializer, P = AlwaysSuccess> {
    pub serializer: Z,
    pub predicate: P,
}

impl ResultPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<Z, P> ResultPolicy<Z, P> {
    pub fn with_serializer<Z2>(self, serializer: Z2) -> ResultPolicy<Z2, P> {
        ResultPolicy {
            serializer,
            predicate: self.predicate,
        }
    }

    pub fn with_predicate<P2>(self, predicate: P2) -> ResultPolicy<Z, P2> {
        ResultPolicy {
            serializer: self.serializer,
            predicate,
        }
    }
}
