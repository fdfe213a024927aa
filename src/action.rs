use crate::merge::RemoteSnapshot;
use crate::model::{
    Analysis, AnalysisId, AnalysisStatus, Annotation, AppState, BlobRef, Concept, Dimensions,
    EntityId, Group, GroupAnalysis, GroupId, Image, ImageId, ImageStatus, Suggestion, UnixTimeMs,
};

/// Partial update for an [`Image`]. `None` leaves the field untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImagePatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub blob_ref: Option<BlobRef>,
    pub dimensions: Option<Dimensions>,
    pub status: Option<ImageStatus>,
}

impl ImagePatch {
    #[must_use]
    pub fn status(status: ImageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub(crate) fn apply(self, image: &mut Image) {
        if let Some(name) = self.name {
            image.name = name;
        }
        if let Some(url) = self.url {
            image.url = Some(url);
        }
        if let Some(blob_ref) = self.blob_ref {
            image.blob_ref = Some(blob_ref);
        }
        if let Some(dimensions) = self.dimensions {
            image.dimensions = dimensions;
        }
        if let Some(status) = self.status {
            image.status = status;
        }
    }
}

/// Partial update for the [`Analysis`] of an image. Creates the analysis
/// when the image has none yet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnalysisPatch {
    pub id: Option<AnalysisId>,
    pub status: Option<AnalysisStatus>,
    pub summary: Option<String>,
    pub annotations: Option<Vec<Annotation>>,
    pub suggestions: Option<Vec<Suggestion>>,
}

impl AnalysisPatch {
    #[must_use]
    pub fn status(status: AnalysisStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub(crate) fn apply(self, analysis: &mut Analysis) {
        if let Some(id) = self.id {
            analysis.id = id;
        }
        if let Some(status) = self.status {
            analysis.status = status;
        }
        if let Some(summary) = self.summary {
            analysis.summary = summary;
        }
        if let Some(annotations) = self.annotations {
            analysis.annotations = annotations;
        }
        if let Some(suggestions) = self.suggestions {
            analysis.suggestions = suggestions;
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Take the remote snapshot as-is and clear the pending set.
    pub force_replace: bool,
}

impl MergeOptions {
    pub const GATED: Self = Self {
        force_replace: false,
    };
    pub const FORCE_REPLACE: Self = Self {
        force_replace: true,
    };
}

/// Every state transition the store accepts.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    AddImages(Vec<Image>),
    UpdateImage { id: ImageId, patch: ImagePatch },
    RemoveImage(ImageId),
    UpdateAnalysis { image_id: ImageId, patch: AnalysisPatch },
    SelectImage(Option<ImageId>),
    SetGroups(Vec<Group>),
    UpsertGroup(Group),
    RemoveGroup(GroupId),
    SetGroupAnalyses(Vec<GroupAnalysis>),
    SetConcepts(Vec<Concept>),

    BatchUpload {
        images: Vec<Image>,
        analyses: Vec<Analysis>,
    },

    AddPendingSync(Vec<EntityId>),
    RemovePendingSync(Vec<EntityId>),
    SetUploading(bool),
    SetSyncing(bool),
    MarkSynced(UnixTimeMs),

    MergeFromDatabase {
        snapshot: Box<RemoteSnapshot>,
        options: MergeOptions,
    },

    /// Replaces the content with a persisted session. The version keeps
    /// counting from the current value.
    RestoreSession(Box<AppState>),
    ResetState,
}

impl Action {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AddImages(_) => "add_images",
            Self::UpdateImage { .. } => "update_image",
            Self::RemoveImage(_) => "remove_image",
            Self::UpdateAnalysis { .. } => "update_analysis",
            Self::SelectImage(_) => "select_image",
            Self::SetGroups(_) => "set_groups",
            Self::UpsertGroup(_) => "upsert_group",
            Self::RemoveGroup(_) => "remove_group",
            Self::SetGroupAnalyses(_) => "set_group_analyses",
            Self::SetConcepts(_) => "set_concepts",
            Self::BatchUpload { .. } => "batch_upload",
            Self::AddPendingSync(_) => "add_pending_sync",
            Self::RemovePendingSync(_) => "remove_pending_sync",
            Self::SetUploading(_) => "set_uploading",
            Self::SetSyncing(_) => "set_syncing",
            Self::MarkSynced(_) => "mark_synced",
            Self::MergeFromDatabase { .. } => "merge_from_database",
            Self::RestoreSession(_) => "restore_session",
            Self::ResetState => "reset_state",
        }
    }

    #[must_use]
    pub fn update_image_status(id: ImageId, status: ImageStatus) -> Self {
        Self::UpdateImage {
            id,
            patch: ImagePatch::status(status),
        }
    }

    #[must_use]
    pub fn merge(snapshot: RemoteSnapshot, options: MergeOptions) -> Self {
        Self::MergeFromDatabase {
            snapshot: Box::new(snapshot),
            options,
        }
    }
}
