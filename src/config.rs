use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{AppError, ErrorKind};
use crate::image_processing::ProcessingConfig;
use crate::retry::RetryPolicy;
use crate::MAX_UPLOAD_BYTES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::new(ErrorKind::Validation, "Engine configuration is invalid.")
            .with_internal(err.to_string())
    }
}

pub(crate) fn require_nonzero(value: u64, name: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{name} must be > 0")));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Operations allowed to run at once.
    pub concurrency_limit: usize,
    pub tick_interval_ms: u64,
    /// How long completed records stay visible before garbage collection.
    pub completed_grace_ms: u64,
    /// Cap on non-terminal records.
    pub max_operations: usize,
    /// Failed records kept for manual retry. The oldest go first.
    pub max_failed_retained: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 3,
            tick_interval_ms: 2_000,
            completed_grace_ms: 30_000,
            max_operations: 500,
            max_failed_retained: 100,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero(self.concurrency_limit as u64, "queue.concurrency_limit")?;
        require_nonzero(self.tick_interval_ms, "queue.tick_interval_ms")?;
        require_nonzero(self.max_operations as u64, "queue.max_operations")?;
        require_nonzero(self.max_failed_retained as u64, "queue.max_failed_retained")?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_file_bytes: usize,
    pub max_batch_files: usize,
    /// Storage path prefix for uploaded blobs.
    pub storage_prefix: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: MAX_UPLOAD_BYTES,
            max_batch_files: 50,
            storage_prefix: "uploads".into(),
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero(self.max_file_bytes as u64, "upload.max_file_bytes")?;
        require_nonzero(self.max_batch_files as u64, "upload.max_batch_files")?;
        if self.storage_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("upload.storage_prefix is empty".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub retry: RetryPolicy,
    pub upload: UploadConfig,
    pub processing: ProcessingConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.retry.validate()?;
        self.upload.validate()?;
        self.processing.validate()?;
        Ok(())
    }

    /// Loads overrides from JSON. Missing sections keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}
