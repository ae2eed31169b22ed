use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest key the record table accepts.
pub const MAX_KEY_LEN: usize = 255;

/// Lifecycle marker of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    /// Held by a lock holder that has not committed yet.
    Pending,
    Succeeded,
    /// Terminal failure; the next caller resets it and retries.
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::Succeeded => "SUCCEEDED",
            RecordStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RecordStatus::Pending),
            "SUCCEEDED" => Ok(RecordStatus::Succeeded),
            "FAILED" => Ok(RecordStatus::Failed),
            other => Err(format!("unknown record status '{}'", other)),
        }
    }
}

/// One row of the idempotency table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: RecordStatus,
    pub result: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn pending(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            status: RecordStatus::Pending,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn success(&self) -> bool {
        self.status == RecordStatus::Succeeded
    }

    pub fn is_pending(&self) -> bool {
        self.status == RecordStatus::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.status == RecordStatus::Failed
    }

    /// Returns the cached result of a succeeded record.
    pub fn cached_result(&self) -> Option<&[u8]> {
        match (self.status, self.result.as_deref()) {
            (RecordStatus::Succeeded, Some(bytes)) if !bytes.is_empty() => Some(bytes),
            _ => None,
        }
    }
}

/// Raw row shape as read from Postgres.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RecordRow {
    pub idempotency_key: String,
    pub status: String,
    pub success: bool,
    pub result: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecordRow {
    /// Checks that `status` parses and agrees with the `success` column.
    pub(crate) fn into_record(self) -> Result<IdempotencyRecord, StoreError> {
        let status = self
            .status
            .parse::<RecordStatus>()
            .map_err(|reason| StoreError::CorruptRecord {
                key: self.idempotency_key.clone(),
                reason,
            })?;

        if self.success != (status == RecordStatus::Succeeded) {
            return Err(StoreError::CorruptRecord {
                key: self.idempotency_key,
                reason: format!("success={} disagrees with status {}", self.success, status),
            });
        }

        Ok(IdempotencyRecord {
            key: self.idempotency_key,
            status,
            result: self.result,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
