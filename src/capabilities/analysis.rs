use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::CapabilityError;
use crate::model::{AnalysisId, Annotation, ImageId, Suggestion};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub image_id: ImageId,
    pub image_url: String,
    /// Free-form context from the user, e.g. "checkout page".
    pub context: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Server id of the stored analysis, when the service persists it.
    pub analysis_id: Option<AnalysisId>,
    pub summary: String,
    pub annotations: Vec<Annotation>,
    pub suggestions: Vec<Suggestion>,
}

/// AI analysis service. Implementations apply their own request-level retry
/// policy; the sync queue retries whole operations on top of it.
#[async_trait]
pub trait AnalysisApi: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, CapabilityError>;
}
