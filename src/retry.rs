use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{require_nonzero, ConfigError};
use crate::error::{AppError, ErrorKind};
use crate::model::UnixTimeMs;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transient,
    RateLimited,
    ClientError,
    ServerError,
    NetworkError,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient
                | ErrorCategory::RateLimited
                | ErrorCategory::ServerError
                | ErrorCategory::NetworkError
                | ErrorCategory::Timeout
        )
    }
}

impl From<ErrorKind> for ErrorCategory {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Network => Self::NetworkError,
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::RateLimited => Self::RateLimited,
            ErrorKind::Server | ErrorKind::Storage => Self::ServerError,
            ErrorKind::Conflict => Self::Transient,
            ErrorKind::Unknown => Self::Unknown,
            _ => Self::ClientError,
        }
    }
}

/// Failure recorded on a sync operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub truncated: bool,
    pub timestamp: UnixTimeMs,
}

impl OperationError {
    const MAX_MESSAGE_LENGTH: usize = 512;
    const MAX_CODE_LENGTH: usize = 64;

    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
        now: UnixTimeMs,
    ) -> Self {
        let mut message = message.into();
        let mut code = code.into();

        let message_truncated = message.len() > Self::MAX_MESSAGE_LENGTH;
        let code_truncated = code.len() > Self::MAX_CODE_LENGTH;

        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        truncate_utf8_safe(&mut code, Self::MAX_CODE_LENGTH);

        Self {
            category,
            code,
            message,
            truncated: message_truncated || code_truncated,
            timestamp: now,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

impl From<&AppError> for OperationError {
    fn from(err: &AppError) -> Self {
        let category = if err.is_retryable() {
            ErrorCategory::from(err.kind)
        } else {
            ErrorCategory::ClientError
        };
        let message = match &err.internal_message {
            Some(internal) => format!("{}: {internal}", err.message),
            None => err.message.clone(),
        };
        Self::new(category, err.code(), message, UnixTimeMs::now())
    }
}

impl From<AppError> for OperationError {
    fn from(err: AppError) -> Self {
        Self::from(&err)
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

/// Retry policy shared by every operation kind: `backoff_base ^ attempts`
/// seconds, capped at `max_backoff_ms`, plus up to `jitter_ms` of jitter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: u32,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2,
            max_backoff_ms: 60_000,
            jitter_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero(u64::from(self.max_attempts), "retry.max_attempts")?;
        require_nonzero(u64::from(self.backoff_base), "retry.backoff_base")?;
        require_nonzero(self.max_backoff_ms, "retry.max_backoff_ms")?;
        Ok(())
    }

    pub fn is_retryable(&self, error: &OperationError) -> bool {
        error.is_retryable()
    }

    /// Whether a failure after `attempts` attempts should be retried.
    pub fn should_retry(&self, error: &OperationError, attempts: u32) -> bool {
        self.is_retryable(error) && attempts < self.max_attempts
    }

    /// Delay before the next attempt once `attempts` have failed.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(16);
        let base_delay = u64::from(self.backoff_base)
            .saturating_pow(exponent)
            .saturating_mul(1_000);
        let capped_delay = base_delay.min(self.max_backoff_ms);

        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };

        Duration::from_millis(capped_delay.saturating_add(jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn backoff_is_exponential_in_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(30), Duration::from_millis(60_000));
    }

    #[test]
    fn retry_stops_at_max_attempts() {
        let policy = RetryPolicy::default();
        let error = OperationError::new(ErrorCategory::NetworkError, "E", "offline", UnixTimeMs(0));
        assert!(policy.should_retry(&error, 2));
        assert!(!policy.should_retry(&error, 3));

        let client = OperationError::new(ErrorCategory::ClientError, "E", "bad", UnixTimeMs(0));
        assert!(!policy.should_retry(&client, 0));
    }

    #[test]
    fn operation_error_truncates_on_char_boundary() {
        let message = "é".repeat(400);
        let error = OperationError::new(ErrorCategory::Unknown, "E", message, UnixTimeMs(0));
        assert!(error.truncated);
        assert!(error.message.len() <= 512);
        assert!(error.message.chars().all(|c| c == 'é'));
    }

    #[test]
    fn app_error_conversion_keeps_retryability() {
        let transient = AppError::new(ErrorKind::Storage, "503");
        assert!(OperationError::from(&transient).is_retryable());

        let permanent = AppError::new(ErrorKind::ImageFormatUnsupported, "tiff");
        let converted = OperationError::from(&permanent);
        assert!(!converted.is_retryable());
        assert_eq!(converted.code, "IMAGE_FORMAT_UNSUPPORTED");
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_cap_plus_jitter(attempts in 0u32..64, jitter in 0u64..5_000) {
            let policy = RetryPolicy { jitter_ms: jitter, ..RetryPolicy::default() };
            let delay = policy.backoff(attempts);
            prop_assert!(delay <= Duration::from_millis(policy.max_backoff_ms + jitter));
        }
    }
}
