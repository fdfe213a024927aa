//! Collaborators the engine consumes. Transport, auth and the analysis
//! model live behind these traits.

mod analysis;
pub mod memory;
mod persistence;
mod storage;

pub use self::analysis::{AnalysisApi, AnalysisRequest, AnalysisResult};
pub use self::persistence::PersistenceApi;
pub use self::storage::{BlobStorage, StoredBlob};

use crate::error::{AppError, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl CapabilityError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Unauthorized(_) => ErrorKind::Authentication,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Server { status, .. } if *status >= 500 => ErrorKind::Server,
            Self::Server { status: 409, .. } => ErrorKind::Conflict,
            Self::Server { .. } => ErrorKind::Validation,
            Self::Storage(_) => ErrorKind::Storage,
            Self::InvalidRequest(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

impl From<CapabilityError> for AppError {
    fn from(err: CapabilityError) -> Self {
        let kind = err.kind();
        AppError::new(kind, err.to_string())
    }
}
