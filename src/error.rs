use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::MAX_UPLOAD_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    QuotaExceeded,
    Storage,
    Server,
    Serialization,
    Deserialization,
    ImageProcessing,
    ImageTooLarge,
    ImageDimensionsTooLarge,
    ImageFormatUnsupported,
    Analysis,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 21] = [
        Self::Network,
        Self::Timeout,
        Self::Authentication,
        Self::Authorization,
        Self::Validation,
        Self::NotFound,
        Self::Conflict,
        Self::RateLimited,
        Self::QuotaExceeded,
        Self::Storage,
        Self::Server,
        Self::Serialization,
        Self::Deserialization,
        Self::ImageProcessing,
        Self::ImageTooLarge,
        Self::ImageDimensionsTooLarge,
        Self::ImageFormatUnsupported,
        Self::Analysis,
        Self::InvalidState,
        Self::Internal,
        Self::Unknown,
    ];

    /// Inverse of [`ErrorKind::code`]. Unrecognized codes map to `Unknown`.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .unwrap_or(Self::Unknown)
    }

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::Storage => "STORAGE_ERROR",
            Self::Server => "SERVER_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::ImageProcessing => "IMAGE_PROCESSING_ERROR",
            Self::ImageTooLarge => "IMAGE_TOO_LARGE",
            Self::ImageDimensionsTooLarge => "IMAGE_DIMENSIONS_TOO_LARGE",
            Self::ImageFormatUnsupported => "IMAGE_FORMAT_UNSUPPORTED",
            Self::Analysis => "ANALYSIS_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::Conflict
            | Self::RateLimited
            | Self::Storage
            | Self::Server => ErrorSeverity::Transient,

            Self::Serialization
            | Self::Deserialization
            | Self::Internal
            | Self::InvalidState => ErrorSeverity::Fatal,

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::QuotaExceeded
            | Self::ImageProcessing
            | Self::ImageTooLarge
            | Self::ImageDimensionsTooLarge
            | Self::ImageFormatUnsupported
            | Self::Analysis
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::RateLimited
                | Self::Storage
                | Self::Server
                | Self::Conflict
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => {
                "Your session has expired. Please sign in again.".into()
            }
            ErrorKind::Authorization => {
                "You don't have permission to perform this action.".into()
            }
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Conflict => {
                "This action conflicts with a recent change. Please refresh and try again.".into()
            }
            ErrorKind::RateLimited => {
                "Too many requests. Please wait a moment and try again.".into()
            }
            ErrorKind::QuotaExceeded => {
                "Too many uploads are waiting to sync. Please wait for them to finish.".into()
            }
            ErrorKind::Storage | ErrorKind::Server => {
                "The server could not store your upload. Please try again later.".into()
            }
            ErrorKind::Serialization | ErrorKind::Deserialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::ImageProcessing => {
                "Unable to read the image. Please try a different file.".into()
            }
            ErrorKind::ImageTooLarge => format!(
                "The image is too large. Please use an image smaller than {} MB.",
                MAX_UPLOAD_BYTES / 1_000_000
            ),
            ErrorKind::ImageDimensionsTooLarge => {
                "The image dimensions are too large.".into()
            }
            ErrorKind::ImageFormatUnsupported => {
                "This image format is not supported. Please use JPEG, PNG, or WebP.".into()
            }
            ErrorKind::Analysis => "The analysis could not be completed. Please retry.".into(),
            ErrorKind::InvalidState => {
                "The app is in an invalid state. Please reload and try again.".into()
            }
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Storage.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::ImageFormatUnsupported.is_retryable());
    }

    #[test]
    fn fatal_severity_disables_retry() {
        let error =
            AppError::new(ErrorKind::Network, "offline").with_severity(ErrorSeverity::Fatal);
        assert!(!error.is_retryable());
    }

    #[test]
    fn display_includes_internal_message() {
        let error = AppError::new(ErrorKind::Storage, "upload failed").with_internal("503");
        assert_eq!(error.to_string(), "[STORAGE_ERROR] upload failed (internal: 503)");
    }

    #[test]
    fn codes_map_back_to_kinds() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
        assert_eq!(ErrorKind::from_code("TEAPOT"), ErrorKind::Unknown);
    }

    #[test]
    fn analysis_failures_have_their_own_message() {
        let error = AppError::new(ErrorKind::Analysis, "model rejected image");
        assert_eq!(error.code(), "ANALYSIS_ERROR");
        assert_eq!(error.severity, ErrorSeverity::Permanent);
        assert!(error.user_facing_message().contains("analysis"));
    }
}
