use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::action::{Action, AnalysisPatch, ImagePatch};
use crate::capabilities::{
    AnalysisApi, AnalysisRequest, BlobStorage, CapabilityError, PersistenceApi,
};
use crate::error::{AppError, ErrorKind};
use crate::image_processing::ImageProcessor;
use crate::mapping::records_from_state;
use crate::model::{AnalysisStatus, ImageStatus, UnixTimeMs};
use crate::retry::OperationError;
use crate::store::Store;
use crate::sync_queue::{OperationPayload, SyncOperation};

/// What a successful operation body asks the queue to do next.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OperationOutcome {
    /// Dispatched in order once the operation completes.
    pub actions: Vec<Action>,
    /// Enqueued for the same entity before the operation is marked complete.
    pub follow_ups: Vec<OperationPayload>,
}

/// Executes operation bodies. Keeps the queue independent of collaborators.
#[async_trait]
pub trait OperationRunner: Send + Sync {
    async fn run(&self, operation: &SyncOperation) -> Result<OperationOutcome, OperationError>;
}

/// Runs operations against the injected storage, analysis and persistence
/// collaborators.
pub struct CollaboratorRunner {
    storage: Arc<dyn BlobStorage>,
    analysis: Arc<dyn AnalysisApi>,
    persistence: Arc<dyn PersistenceApi>,
    processor: Arc<ImageProcessor>,
    store: Store,
}

impl CollaboratorRunner {
    pub fn new(
        storage: Arc<dyn BlobStorage>,
        analysis: Arc<dyn AnalysisApi>,
        persistence: Arc<dyn PersistenceApi>,
        processor: Arc<ImageProcessor>,
        store: Store,
    ) -> Self {
        Self {
            storage,
            analysis,
            persistence,
            processor,
            store,
        }
    }
}

fn op_error(err: impl Into<AppError>) -> OperationError {
    OperationError::from(err.into())
}

/// Failures the analysis service will not recover from on its own are
/// reported as analysis errors.
fn analysis_error(err: CapabilityError) -> OperationError {
    let app_error = AppError::from(err);
    if app_error.is_retryable() {
        return OperationError::from(app_error);
    }
    let internal = app_error.code();
    OperationError::from(
        AppError::new(ErrorKind::Analysis, app_error.message).with_internal(internal),
    )
}

#[async_trait]
impl OperationRunner for CollaboratorRunner {
    #[instrument(
        skip(self, operation),
        fields(op_id = %operation.id, entity_id = %operation.entity_id)
    )]
    async fn run(&self, operation: &SyncOperation) -> Result<OperationOutcome, OperationError> {
        let image_id = operation.entity_id.to_image_id();

        match &operation.payload {
            OperationPayload::UploadImage {
                bytes,
                path,
                content_type,
            } => {
                let blob = self
                    .storage
                    .upload(bytes.clone(), path, content_type)
                    .await
                    .map_err(op_error)?;
                let url = blob.url.to_string();
                debug!(%url, "image stored");

                Ok(OperationOutcome {
                    actions: vec![Action::UpdateImage {
                        id: image_id,
                        patch: ImagePatch::status(ImageStatus::Analyzing).with_url(url.clone()),
                    }],
                    follow_ups: vec![OperationPayload::RequestAnalysis {
                        image_url: url,
                        context: None,
                    }],
                })
            }

            OperationPayload::RequestAnalysis { image_url, context } => {
                let request = AnalysisRequest {
                    image_id: image_id.clone(),
                    image_url: image_url.clone(),
                    context: context.clone(),
                };
                let result = self
                    .analysis
                    .analyze(&request)
                    .await
                    .map_err(analysis_error)?;

                Ok(OperationOutcome {
                    actions: vec![
                        Action::UpdateAnalysis {
                            image_id: image_id.clone(),
                            patch: AnalysisPatch {
                                id: result.analysis_id,
                                status: Some(AnalysisStatus::Completed),
                                summary: Some(result.summary),
                                annotations: Some(result.annotations),
                                suggestions: Some(result.suggestions),
                            },
                        },
                        Action::update_image_status(image_id, ImageStatus::Completed),
                    ],
                    follow_ups: Vec::new(),
                })
            }

            OperationPayload::ExtractMetadata { bytes } => {
                let probed = self.processor.probe(bytes.clone()).await.map_err(op_error)?;
                Ok(OperationOutcome {
                    actions: vec![Action::UpdateImage {
                        id: image_id,
                        patch: ImagePatch::default().with_dimensions(probed.dimensions),
                    }],
                    follow_ups: Vec::new(),
                })
            }

            OperationPayload::BatchSync => {
                let state = self.store.state();
                let records = records_from_state(&state);
                self.persistence
                    .migrate_all(&records)
                    .await
                    .map_err(op_error)?;
                debug!(images = records.images.len(), "local state migrated");

                Ok(OperationOutcome {
                    actions: vec![Action::MarkSynced(UnixTimeMs::now()), Action::SetSyncing(false)],
                    follow_ups: Vec::new(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::memory::{MemoryAnalysis, MemoryBlobStorage, MemoryPersistence};
    use crate::model::EntityId;
    use crate::retry::ErrorCategory;

    fn runner() -> CollaboratorRunner {
        CollaboratorRunner::new(
            Arc::new(MemoryBlobStorage::default()),
            Arc::new(MemoryAnalysis::new()),
            Arc::new(MemoryPersistence::new()),
            Arc::new(ImageProcessor::with_defaults()),
            Store::default(),
        )
    }

    #[tokio::test]
    async fn rejected_analysis_request_is_a_permanent_analysis_error() {
        let op = SyncOperation::new(
            EntityId::new("img-1"),
            OperationPayload::RequestAnalysis {
                image_url: String::new(),
                context: None,
            },
            3,
            1,
        );

        let error = runner().run(&op).await.unwrap_err();
        assert_eq!(error.code, "ANALYSIS_ERROR");
        assert_eq!(error.category, ErrorCategory::ClientError);
        assert!(!error.is_retryable());
        assert!(error.message.contains("image url is empty"));
    }

    #[test]
    fn transient_analysis_failures_keep_their_kind() {
        let error = analysis_error(CapabilityError::Timeout("slow model".into()));
        assert_eq!(error.code, "TIMEOUT");
        assert!(error.is_retryable());
    }
}
