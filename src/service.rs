use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::action::{Action, MergeOptions};
use crate::capabilities::{AnalysisApi, BlobStorage, CapabilityError, PersistenceApi};
use crate::config::{ConfigError, EngineConfig};
use crate::error::{AppError, ErrorKind};
use crate::event::{EventBus, Notification};
use crate::image_processing::ImageProcessor;
use crate::mapping::{to_remote_snapshot, MappingWarning};
use crate::model::{AppState, EntityId, ImageId, UnixTimeMs};
use crate::offline_store::{self, SnapshotError};
use crate::runner::CollaboratorRunner;
use crate::store::{Store, StoreError};
use crate::sync_queue::{
    OperationId, OperationPayload, OperationStatus, QueueError, SyncQueue, BATCH_SYNC_ENTITY,
};
use crate::upload::{UploadError, UploadFile, UploadPipeline, UploadReport};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("collaborator failed: {0}")]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("no snapshot path configured")]
    NoSnapshotPath,

    #[error("nothing to retry for {0}")]
    NothingToRetry(ImageId),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Config(e) => e.into(),
            ServiceError::Store(e) => e.into(),
            ServiceError::Queue(e) => e.into(),
            ServiceError::Upload(e) => e.into(),
            ServiceError::Capability(e) => e.into(),
            ServiceError::Snapshot(e) => e.into(),
            ServiceError::NoSnapshotPath => AppError::new(ErrorKind::InvalidState, err.to_string()),
            ServiceError::NothingToRetry(_) => AppError::new(ErrorKind::NotFound, err.to_string()),
            ServiceError::Task(_) => AppError::new(ErrorKind::Internal, err.to_string()),
        }
    }
}

/// Result of pulling the remote snapshot into the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Merged { warnings: Vec<MappingWarning> },
    /// The remote snapshot matched local state.
    Unchanged { warnings: Vec<MappingWarning> },
    /// Local work is in flight; nothing was applied.
    Deferred { reason: String },
}

/// External services the session runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn BlobStorage>,
    pub analysis: Arc<dyn AnalysisApi>,
    pub persistence: Arc<dyn PersistenceApi>,
}

impl Collaborators {
    /// In-process collaborators for offline mode.
    pub fn in_memory() -> Self {
        use crate::capabilities::memory::{MemoryAnalysis, MemoryBlobStorage, MemoryPersistence};
        Self {
            storage: Arc::new(MemoryBlobStorage::default()),
            analysis: Arc::new(MemoryAnalysis::new()),
            persistence: Arc::new(MemoryPersistence::new()),
        }
    }
}

/// One session: the store, its sync queue and the upload pipeline wired to
/// the injected collaborators.
pub struct SyncService {
    store: Store,
    events: EventBus,
    queue: SyncQueue,
    pipeline: UploadPipeline,
    persistence: Arc<dyn PersistenceApi>,
    snapshot_path: Option<PathBuf>,
    user: RwLock<Option<String>>,
}

impl SyncService {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self, ServiceError> {
        config.validate()?;

        let store = Store::default();
        let events = EventBus::default();
        let processor = Arc::new(ImageProcessor::new(config.processing.clone()));

        let runner = Arc::new(CollaboratorRunner::new(
            collaborators.storage,
            collaborators.analysis,
            Arc::clone(&collaborators.persistence),
            Arc::clone(&processor),
            store.clone(),
        ));
        let queue = SyncQueue::new(
            store.clone(),
            runner,
            events.clone(),
            config.queue.clone(),
            config.retry.clone(),
        );
        let pipeline = UploadPipeline::new(
            store.clone(),
            queue.clone(),
            processor,
            events.clone(),
            config.upload,
        );

        Ok(Self {
            store,
            events,
            queue,
            pipeline,
            persistence: collaborators.persistence,
            snapshot_path: None,
            user: RwLock::new(None),
        })
    }

    /// Enables `save_snapshot`/`restore_snapshot` at this path.
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn state(&self) -> Arc<AppState> {
        self.store.state()
    }

    pub async fn current_user(&self) -> Option<String> {
        self.user.read().await.clone()
    }

    /// Restores the saved session, if any, and starts the sync worker.
    #[instrument(skip(self))]
    pub async fn init(&self) -> Result<(), ServiceError> {
        if self.snapshot_path.is_some() {
            match self.restore_snapshot().await {
                Ok(_) => {}
                Err(ServiceError::Snapshot(e)) => {
                    warn!("saved session discarded: {}", e);
                    self.events.notify(Notification::warning(
                        "Session not restored",
                        "Your previous session could not be read and was discarded.",
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        self.queue.start().await;
        info!("sync service initialized");
        Ok(())
    }

    /// Stops the worker and drops all queued work and local state.
    #[instrument(skip(self))]
    pub async fn reset(&self) {
        self.queue.stop().await;
        self.queue.clear().await;
        self.store.dispatch(Action::ResetState);
        *self.user.write().await = None;
        info!("sync service reset");
    }

    pub async fn upload(&self, files: Vec<UploadFile>) -> Result<UploadReport, ServiceError> {
        Ok(self.pipeline.upload(files).await?)
    }

    /// Pulls the remote snapshot and merges it unless local work is pending.
    #[instrument(skip(self))]
    pub async fn sync_now(&self) -> Result<SyncOutcome, ServiceError> {
        self.pull(MergeOptions::GATED).await
    }

    async fn pull(&self, options: MergeOptions) -> Result<SyncOutcome, ServiceError> {
        let records = self.persistence.load_all().await?;
        let mapped = to_remote_snapshot(records, UnixTimeMs::now());

        match self
            .store
            .try_dispatch(Action::merge(mapped.snapshot, options))
        {
            Ok(true) => {
                info!(warnings = mapped.warnings.len(), "remote snapshot merged");
                Ok(SyncOutcome::Merged {
                    warnings: mapped.warnings,
                })
            }
            Ok(false) => Ok(SyncOutcome::Unchanged {
                warnings: mapped.warnings,
            }),
            Err(StoreError::Deferred(reason)) => Ok(SyncOutcome::Deferred { reason }),
            Err(e) => Err(e.into()),
        }
    }

    /// Queues a migration of the whole local state to the database.
    #[instrument(skip(self))]
    pub async fn sync_to_database(&self) -> Result<OperationId, ServiceError> {
        self.store.dispatch(Action::SetSyncing(true));
        match self
            .queue
            .enqueue(EntityId::new(BATCH_SYNC_ENTITY), OperationPayload::BatchSync)
            .await
        {
            Ok(id) => Ok(id),
            Err(e) => {
                self.store.dispatch(Action::SetSyncing(false));
                Err(e.into())
            }
        }
    }

    /// Switches to `user`: queued work of the previous session is dropped
    /// and the remote snapshot replaces local state.
    #[instrument(skip(self))]
    pub async fn login(&self, user: &str) -> Result<SyncOutcome, ServiceError> {
        self.queue.clear().await;
        *self.user.write().await = Some(user.to_string());
        self.pull(MergeOptions::FORCE_REPLACE).await
    }

    #[instrument(skip(self))]
    pub async fn logout(&self) {
        self.queue.clear().await;
        self.store.dispatch(Action::ResetState);
        *self.user.write().await = None;
        info!("logged out");
    }

    /// Cancels queued work for the image, then removes it.
    #[instrument(skip(self, id), fields(image_id = %id))]
    pub async fn remove_image(&self, id: &ImageId) -> Result<(), ServiceError> {
        self.queue.cancel_entity(&EntityId::from(id)).await;
        self.store.try_dispatch(Action::RemoveImage(id.clone()))?;
        Ok(())
    }

    /// Re-arms the most recent failed operation of the image.
    #[instrument(skip(self, id), fields(image_id = %id))]
    pub async fn retry_image(&self, id: &ImageId) -> Result<OperationId, ServiceError> {
        let failed = self
            .queue
            .operations_for(&EntityId::from(id))
            .await
            .into_iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .max_by_key(|op| op.seq)
            .ok_or_else(|| ServiceError::NothingToRetry(id.clone()))?;

        self.queue.retry(&failed.id).await?;
        Ok(failed.id)
    }

    /// Re-probes the image bytes and updates its dimensions.
    #[instrument(skip(self, id, bytes), fields(image_id = %id))]
    pub async fn refresh_metadata(
        &self,
        id: &ImageId,
        bytes: Bytes,
    ) -> Result<OperationId, ServiceError> {
        if !self.store.state().contains_image(id) {
            return Err(StoreError::Validation(format!("unknown image id {id:?}")).into());
        }
        let op = self
            .queue
            .enqueue(EntityId::from(id), OperationPayload::ExtractMetadata { bytes })
            .await?;
        Ok(op)
    }

    #[instrument(skip(self))]
    pub async fn save_snapshot(&self) -> Result<(), ServiceError> {
        let path = self.snapshot_path.clone().ok_or(ServiceError::NoSnapshotPath)?;
        let state = self.store.state();
        tokio::task::spawn_blocking(move || offline_store::save_to_path(&path, &state)).await??;
        Ok(())
    }

    /// Returns whether a saved session was found and applied.
    #[instrument(skip(self))]
    pub async fn restore_snapshot(&self) -> Result<bool, ServiceError> {
        let path = self.snapshot_path.clone().ok_or(ServiceError::NoSnapshotPath)?;
        let restored =
            tokio::task::spawn_blocking(move || offline_store::load_from_path(&path)).await??;

        let Some(restored) = restored else {
            return Ok(false);
        };
        if restored.interrupted > 0 {
            self.events.notify(Notification::warning(
                "Uploads interrupted",
                format!(
                    "{} uploads did not finish before the app closed. Please upload them again.",
                    restored.interrupted
                ),
            ));
        }
        self.store
            .dispatch(Action::RestoreSession(Box::new(restored.state)));
        Ok(true)
    }

    /// Stops the background worker. Queued work stays queued.
    pub async fn shutdown(&self) {
        self.queue.stop().await;
    }
}
