use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::action::{Action, AnalysisPatch};
use crate::config::UploadConfig;
use crate::error::{AppError, ErrorKind};
use crate::event::{EventBus, Notification};
use crate::image_processing::ImageProcessor;
use crate::model::{Analysis, AnalysisStatus, BlobRef, EntityId, Image, ImageId, ImageStatus};
use crate::store::{Store, StoreError};
use crate::sync_queue::{OperationPayload, SyncQueue};

/// One file handed over by the UI.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Bytes,
    /// Declared by the picker. The probed format wins when they disagree.
    pub content_type: Option<String>,
    /// Preview URL the UI can show before the blob is stored remotely.
    pub local_url: Option<String>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            content_type: None,
            local_url: None,
        }
    }

    pub fn with_local_url(mut self, url: impl Into<String>) -> Self {
        self.local_url = Some(url.into());
        self
    }
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .field("content_type", &self.content_type)
            .field("local_url", &self.local_url)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Images placed in the store and queued for upload.
    pub accepted: Vec<ImageId>,
    /// Files rejected before reaching the store.
    pub failures: Vec<FileFailure>,
    /// Images placed in the store but refused by a full queue.
    pub queue_rejected: Vec<ImageId>,
}

impl UploadReport {
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.failures.is_empty() && self.queue_rejected.is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("all {} files failed", .failures.len())]
    AllFailed { failures: Vec<FileFailure> },

    #[error("too many files: {count}, max {max}")]
    TooManyFiles { count: usize, max: usize },

    #[error("batch rejected by store: {0}")]
    Rejected(#[from] StoreError),
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let kind = match &err {
            UploadError::AllFailed { .. } => ErrorKind::ImageProcessing,
            UploadError::TooManyFiles { .. } => ErrorKind::QuotaExceeded,
            UploadError::Rejected(_) => ErrorKind::Validation,
        };
        AppError::new(kind, err.to_string())
    }
}

/// Clears `is_uploading` however the batch ends.
struct UploadingGuard<'a>(&'a Store);

impl<'a> UploadingGuard<'a> {
    fn engage(store: &'a Store) -> Self {
        store.dispatch(Action::SetUploading(true));
        Self(store)
    }
}

impl Drop for UploadingGuard<'_> {
    fn drop(&mut self) {
        self.0.dispatch(Action::SetUploading(false));
    }
}

/// Turns raw files into placeholders and queued uploads.
#[derive(Clone)]
pub struct UploadPipeline {
    store: Store,
    queue: SyncQueue,
    processor: Arc<ImageProcessor>,
    events: EventBus,
    config: UploadConfig,
}

impl UploadPipeline {
    pub fn new(
        store: Store,
        queue: SyncQueue,
        processor: Arc<ImageProcessor>,
        events: EventBus,
        config: UploadConfig,
    ) -> Self {
        Self {
            store,
            queue,
            processor,
            events,
            config,
        }
    }

    #[instrument(skip(self, files), fields(files = files.len()))]
    pub async fn upload(&self, files: Vec<UploadFile>) -> Result<UploadReport, UploadError> {
        if files.is_empty() {
            return Ok(UploadReport::default());
        }
        if files.len() > self.config.max_batch_files {
            return Err(UploadError::TooManyFiles {
                count: files.len(),
                max: self.config.max_batch_files,
            });
        }

        let _uploading = UploadingGuard::engage(&self.store);
        let total = files.len();

        let mut report = UploadReport::default();
        let mut images = Vec::with_capacity(total);
        let mut analyses = Vec::with_capacity(total);
        let mut payloads = Vec::with_capacity(total);

        for file in files {
            match self.prepare(file).await {
                Ok((image, payload)) => {
                    analyses.push(Analysis::placeholder(image.id.clone()));
                    payloads.push((image.id.clone(), payload));
                    images.push(image);
                }
                Err(failure) => {
                    warn!(name = %failure.name, "file rejected: {}", failure.reason);
                    report.failures.push(failure);
                }
            }
        }

        if images.is_empty() {
            let error = UploadError::AllFailed {
                failures: report.failures,
            };
            let message = AppError::from(error.clone()).user_facing_message();
            self.events.notify(Notification::error("Upload failed", message));
            return Err(error);
        }

        let ids: Vec<EntityId> = images.iter().map(|i| EntityId::from(&i.id)).collect();
        self.store
            .try_dispatch(Action::BatchUpload { images, analyses })?;
        self.store.dispatch(Action::AddPendingSync(ids));

        for (image_id, payload) in payloads {
            match self.queue.enqueue(EntityId::from(&image_id), payload).await {
                Ok(op_id) => {
                    debug!(%image_id, %op_id, "upload queued");
                    report.accepted.push(image_id);
                }
                Err(e) => {
                    warn!(%image_id, "upload not queued: {}", e);
                    self.reject(&image_id);
                    report.queue_rejected.push(image_id);
                }
            }
        }

        let failed = report.failures.len() + report.queue_rejected.len();
        if failed > 0 {
            self.events.notify(Notification::warning(
                "Some uploads failed",
                format!("{failed} of {total} files could not be uploaded."),
            ));
        }

        info!(
            accepted = report.accepted.len(),
            failed, "upload batch dispatched"
        );
        Ok(report)
    }

    /// Validates and probes one file, building its placeholder and upload.
    async fn prepare(&self, file: UploadFile) -> Result<(Image, OperationPayload), FileFailure> {
        let fail = |reason: String| FileFailure {
            name: file.name.clone(),
            reason,
        };

        if file.bytes.len() > self.config.max_file_bytes {
            return Err(fail(format!(
                "{} bytes exceeds the {} byte limit",
                file.bytes.len(),
                self.config.max_file_bytes
            )));
        }

        let probed = self
            .processor
            .probe(file.bytes.clone())
            .await
            .map_err(|e| fail(e.to_string()))?;

        let id = ImageId::temporary();
        let uri = file
            .local_url
            .clone()
            .unwrap_or_else(|| format!("local://{id}"));
        let blob = BlobRef {
            uri,
            size_bytes: file.bytes.len() as u64,
            content_hash: Some(probed.content_hash),
            content_type: Some(probed.content_type.to_string()),
        };

        let image = Image::placeholder(
            id.clone(),
            file.name,
            probed.dimensions,
            file.local_url,
            Some(blob),
        );
        let payload = OperationPayload::UploadImage {
            bytes: file.bytes,
            path: format!("{}/{id}", self.config.storage_prefix.trim_end_matches('/')),
            content_type: probed.content_type.to_string(),
        };
        Ok((image, payload))
    }

    fn reject(&self, image_id: &ImageId) {
        self.store
            .dispatch(Action::update_image_status(image_id.clone(), ImageStatus::Error));
        self.store.dispatch(Action::UpdateAnalysis {
            image_id: image_id.clone(),
            patch: AnalysisPatch::status(AnalysisStatus::Failed),
        });
        self.store
            .dispatch(Action::RemovePendingSync(vec![EntityId::from(image_id)]));
    }
}
