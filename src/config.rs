use crate::error::{IdempotencyError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

pub const DEFAULT_TABLE_NAME: &str = "sys_idempotent_log";

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub idempotency: CoordinatorConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> std::result::Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}

/// Tuning of the lock/poll protocol.
///
/// `max_retries × retry_interval` is the longest a caller waits on an
/// in-flight holder before giving up with a lock timeout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CoordinatorConfig {
    #[validate(range(min = 1))]
    pub max_retries: u32,
    #[serde(rename = "retry_interval_ms", with = "duration_ms")]
    #[validate(custom = "validate_retry_interval")]
    pub retry_interval: Duration,
    #[validate(custom = "validate_table_name")]
    pub table_name: String,
    #[validate(range(min = 1))]
    pub max_result_bytes: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 50,
            retry_interval: Duration::from_millis(200),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            max_result_bytes: 10 * 1024,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_retries(mut self, max_retries: u32, retry_interval: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_max_result_bytes(mut self, max_result_bytes: usize) -> Self {
        self.max_result_bytes = max_result_bytes;
        self
    }

    /// Validates the configuration, returning it unchanged when usable.
    pub fn validated(self) -> Result<Self> {
        self.validate()
            .map_err(|e| IdempotencyError::Config(e.to_string()))?;
        Ok(self)
    }

    /// Upper bound on the time spent polling an in-flight record.
    pub fn wait_ceiling(&self) -> Duration {
        self.retry_interval.saturating_mul(self.max_retries)
    }
}

/// Rejects anything but a plain or schema-qualified identifier.
pub fn check_table_name(name: &str) -> Result<()> {
    validate_table_name(name)
        .map_err(|_| IdempotencyError::Config(format!("invalid table name '{}'", name)))
}

fn validate_retry_interval(interval: &Duration) -> std::result::Result<(), ValidationError> {
    if interval.is_zero() {
        return Err(ValidationError::new("retry_interval_must_be_positive"));
    }
    Ok(())
}

// The table name is spliced into SQL text, so only plain identifiers pass.
fn validate_table_name(name: &str) -> std::result::Result<(), ValidationError> {
    let mut parts = name.split('.');
    let valid = match (parts.next(), parts.next(), parts.next()) {
        (Some(table), None, None) => is_identifier(table),
        (Some(schema), Some(table), None) => is_identifier(schema) && is_identifier(table),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_table_name"))
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    let starts_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    starts_ok && part.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
