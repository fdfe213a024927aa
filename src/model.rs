use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::pending::{PendingSync, Version};

/// Prefix carried by every locally-minted identifier. Server-canonical ids
/// never start with it.
pub const TEMP_ID_PREFIX: &str = "temp-";

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Mints a fresh local-only identifier.
            pub fn temporary() -> Self {
                Self(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_temporary(&self) -> bool {
                self.0.starts_with(TEMP_ID_PREFIX)
            }

            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

typed_id!(ImageId);
typed_id!(AnalysisId);
typed_id!(GroupId);
typed_id!(GroupAnalysisId);
typed_id!(ConceptId);
typed_id!(EntityId);

impl From<&ImageId> for EntityId {
    fn from(id: &ImageId) -> Self {
        Self(id.0.clone())
    }
}

impl From<ImageId> for EntityId {
    fn from(id: ImageId) -> Self {
        Self(id.0)
    }
}

impl EntityId {
    /// Interprets this entity id as an image id. Sync operations in this
    /// system target images except for the whole-state batch sync.
    pub fn to_image_id(&self) -> ImageId {
        ImageId(self.0.clone())
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        )
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Zero-sized dimensions mean "not probed yet".
    #[must_use]
    pub const fn is_known(self) -> bool {
        self.width > 0 && self.height > 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Uploading,
    Processing,
    Analyzing,
    Completed,
    Error,
}

impl ImageStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uploading" => Some(Self::Uploading),
            "processing" => Some(Self::Processing),
            "analyzing" | "analysing" => Some(Self::Analyzing),
            "completed" | "complete" => Some(Self::Completed),
            "error" | "failed" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_in_progress(self) -> bool {
        matches!(self, Self::Uploading | Self::Processing | Self::Analyzing)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "processing" | "pending" => Some(Self::Processing),
            "completed" | "complete" => Some(Self::Completed),
            "failed" | "error" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Don't store image bytes in state. Store a handle/URI.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlobRef {
    pub uri: String,
    pub size_bytes: u64,
    pub content_hash: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Image {
    pub id: ImageId,
    pub name: String,
    /// Canonical URL once stored remotely, a local preview URL before that.
    pub url: Option<String>,
    pub blob_ref: Option<BlobRef>,
    pub dimensions: Dimensions,
    pub status: ImageStatus,
    pub created_at: UnixTimeMs,
    /// Temporary id this record was created from, set on remote records.
    #[serde(default)]
    pub client_ref: Option<ImageId>,
}

impl Image {
    /// Optimistic placeholder shown while the upload is in flight.
    #[must_use]
    pub fn placeholder(
        id: ImageId,
        name: impl Into<String>,
        dimensions: Dimensions,
        url: Option<String>,
        blob_ref: Option<BlobRef>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            url,
            blob_ref,
            dimensions,
            status: ImageStatus::Uploading,
            created_at: UnixTimeMs::now(),
            client_ref: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Annotation {
    pub id: String,
    /// Normalized [0, 1] position on the image.
    pub x: f32,
    pub y: f32,
    pub label: String,
    pub note: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Suggestion {
    pub id: String,
    pub category: String,
    pub title: String,
    pub description: String,
    pub priority: u8,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Analysis {
    pub id: AnalysisId,
    pub image_id: ImageId,
    pub status: AnalysisStatus,
    pub summary: String,
    pub annotations: Vec<Annotation>,
    pub suggestions: Vec<Suggestion>,
}

impl Analysis {
    #[must_use]
    pub fn placeholder(image_id: ImageId) -> Self {
        Self {
            id: AnalysisId::temporary(),
            image_id,
            status: AnalysisStatus::Processing,
            summary: String::new(),
            annotations: Vec::new(),
            suggestions: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub image_ids: Vec<ImageId>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupAnalysis {
    pub id: GroupAnalysisId,
    pub group_id: GroupId,
    pub summary: String,
    pub insights: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Concept {
    pub id: ConceptId,
    pub group_id: Option<GroupId>,
    pub title: String,
    pub description: String,
}

/// Aggregate root owned by the [`crate::store::Store`].
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AppState {
    pub images: Vec<Image>,
    pub analyses: Vec<Analysis>,
    pub groups: Vec<Group>,
    pub group_analyses: Vec<GroupAnalysis>,
    pub concepts: Vec<Concept>,
    pub selected_image_id: Option<ImageId>,
    pub pending_sync: PendingSync,
    pub is_uploading: bool,
    pub is_syncing: bool,
    pub version: Version,
    pub last_sync_timestamp: Option<UnixTimeMs>,
}

impl AppState {
    #[must_use]
    pub fn image(&self, id: &ImageId) -> Option<&Image> {
        self.images.iter().find(|i| &i.id == id)
    }

    #[must_use]
    pub fn contains_image(&self, id: &ImageId) -> bool {
        self.images.iter().any(|i| &i.id == id)
    }

    #[must_use]
    pub fn analysis_for(&self, image_id: &ImageId) -> Option<&Analysis> {
        self.analyses.iter().find(|a| &a.image_id == image_id)
    }

    /// Equality over everything except the version counter.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.images == other.images
            && self.analyses == other.analyses
            && self.groups == other.groups
            && self.group_analyses == other.group_analyses
            && self.concepts == other.concepts
            && self.selected_image_id == other.selected_image_id
            && self.pending_sync == other.pending_sync
            && self.is_uploading == other.is_uploading
            && self.is_syncing == other.is_syncing
            && self.last_sync_timestamp == other.last_sync_timestamp
    }

    /// Analyses whose image no longer exists. Empty in every reachable state.
    pub fn dangling_analyses(&self) -> impl Iterator<Item = &Analysis> {
        self.analyses
            .iter()
            .filter(move |a| !self.contains_image(&a.image_id))
    }
}
