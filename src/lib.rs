//! Client-side state synchronization engine for image upload and UX analysis.
//!
//! A reducer-driven [`Store`] holds the single [`AppState`]. The
//! [`UploadPipeline`] places optimistic placeholders into it, the
//! [`SyncQueue`] performs the real work in the background, and remote
//! snapshots are merged back through [`Action::MergeFromDatabase`], gated by
//! the pending-sync set. [`SyncService`] wires one session together.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod action;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod event;
pub mod image_processing;
pub mod mapping;
pub mod merge;
pub mod model;
pub mod offline_store;
pub mod pending;
mod reducer;
pub mod retry;
pub mod runner;
pub mod service;
pub mod store;
pub mod sync_queue;
pub mod upload;

pub use action::{Action, AnalysisPatch, ImagePatch, MergeOptions};
pub use config::EngineConfig;
pub use error::{AppError, ErrorKind, ErrorSeverity};
pub use event::{EventBus, NoticeLevel, Notification, SyncEvent};
pub use merge::RemoteSnapshot;
pub use model::{
    Analysis, AnalysisId, AnalysisStatus, AppState, EntityId, Image, ImageId, ImageStatus,
    UnixTimeMs,
};
pub use reducer::reduce;
pub use retry::RetryPolicy;
pub use service::{Collaborators, ServiceError, SyncOutcome, SyncService};
pub use store::{Store, StoreError};
pub use sync_queue::{OperationKind, OperationStatus, SyncQueue};
pub use upload::{UploadFile, UploadPipeline, UploadReport};

/// Largest single file accepted for upload.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
