//! Database-shaped records and their conversion to and from domain types.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

use crate::merge::RemoteSnapshot;
use crate::model::{
    Analysis, AnalysisId, AnalysisStatus, Annotation, AppState, BlobRef, Concept, ConceptId,
    Dimensions, Group, GroupAnalysis, GroupAnalysisId, GroupId, Image, ImageId, ImageStatus,
    Suggestion, UnixTimeMs,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageRecord {
    pub id: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub storage_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub content_hash: Option<String>,
    pub content_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub status: Option<String>,
    pub created_at: Option<u64>,
    pub client_ref: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisRecord {
    pub id: Option<String>,
    pub image_id: Option<String>,
    pub status: Option<String>,
    pub summary: Option<String>,
    pub annotations: Option<Vec<Annotation>>,
    pub suggestions: Option<Vec<Suggestion>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupRecord {
    pub id: Option<String>,
    pub name: Option<String>,
    pub image_ids: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupAnalysisRecord {
    pub id: Option<String>,
    pub group_id: Option<String>,
    pub summary: Option<String>,
    pub insights: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConceptRecord {
    pub id: Option<String>,
    pub group_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Everything `load_all` returns and `migrate_all` accepts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSnapshot {
    pub images: Vec<ImageRecord>,
    pub analyses: Vec<AnalysisRecord>,
    pub groups: Vec<GroupRecord>,
    pub group_analyses: Vec<GroupAnalysisRecord>,
    pub concepts: Vec<ConceptRecord>,
}

impl DatabaseSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
            && self.analyses.is_empty()
            && self.groups.is_empty()
            && self.group_analyses.is_empty()
            && self.concepts.is_empty()
    }
}

/// A record that was skipped or repaired while mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MappingWarning {
    MissingId {
        entity: &'static str,
        index: usize,
    },
    TemporaryId {
        entity: &'static str,
        id: String,
    },
    UnknownStatus {
        entity: &'static str,
        id: String,
        value: Option<String>,
    },
    MissingImageReference {
        analysis_id: String,
        image_id: Option<String>,
    },
    InvalidClientRef {
        image_id: String,
        client_ref: String,
    },
}

impl fmt::Display for MappingWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingId { entity, index } => write!(f, "{entity} record #{index} has no id"),
            Self::TemporaryId { entity, id } => {
                write!(f, "{entity} record carries temporary id {id}")
            }
            Self::UnknownStatus { entity, id, value } => {
                write!(f, "{entity} {id} has unknown status {value:?}")
            }
            Self::MissingImageReference {
                analysis_id,
                image_id,
            } => write!(f, "analysis {analysis_id} references missing image {image_id:?}"),
            Self::InvalidClientRef {
                image_id,
                client_ref,
            } => write!(f, "image {image_id} has non-temporary client_ref {client_ref}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MappedSnapshot {
    pub snapshot: RemoteSnapshot,
    pub warnings: Vec<MappingWarning>,
}

/// Validates database records into a [`RemoteSnapshot`]. Invalid records are
/// skipped or repaired and reported, never silently defaulted.
#[must_use]
pub fn to_remote_snapshot(db: DatabaseSnapshot, fetched_at: UnixTimeMs) -> MappedSnapshot {
    let mut warnings = Vec::new();

    let images: Vec<Image> = db
        .images
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| map_image(index, record, &mut warnings))
        .collect();
    let image_ids: HashSet<&ImageId> = images.iter().map(|i| &i.id).collect();

    let analyses: Vec<Analysis> = db
        .analyses
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| map_analysis(index, record, &image_ids, &mut warnings))
        .collect();

    let groups = db
        .groups
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| {
            let id = canonical_id("group", index, record.id, &mut warnings)?;
            Some(Group {
                id: GroupId::new(id),
                name: record.name.unwrap_or_default(),
                image_ids: record
                    .image_ids
                    .unwrap_or_default()
                    .into_iter()
                    .map(ImageId::new)
                    .filter(|member| image_ids.contains(member))
                    .collect(),
            })
        })
        .collect();

    let group_analyses = db
        .group_analyses
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| {
            let id = canonical_id("group analysis", index, record.id, &mut warnings)?;
            let group_id = record.group_id.filter(|g| !g.trim().is_empty());
            let Some(group_id) = group_id else {
                warnings.push(MappingWarning::MissingId {
                    entity: "group analysis group",
                    index,
                });
                return None;
            };
            Some(GroupAnalysis {
                id: GroupAnalysisId::new(id),
                group_id: GroupId::new(group_id),
                summary: record.summary.unwrap_or_default(),
                insights: record.insights.unwrap_or_default(),
            })
        })
        .collect();

    let concepts = db
        .concepts
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| {
            let id = canonical_id("concept", index, record.id, &mut warnings)?;
            Some(Concept {
                id: ConceptId::new(id),
                group_id: record.group_id.map(GroupId::new),
                title: record.title.unwrap_or_default(),
                description: record.description.unwrap_or_default(),
            })
        })
        .collect();

    for warning in &warnings {
        warn!(%warning, "remote record mapping");
    }

    MappedSnapshot {
        snapshot: RemoteSnapshot {
            images,
            analyses,
            groups,
            group_analyses,
            concepts,
            fetched_at,
        },
        warnings,
    }
}

fn canonical_id(
    entity: &'static str,
    index: usize,
    id: Option<String>,
    warnings: &mut Vec<MappingWarning>,
) -> Option<String> {
    let id = match id.map(|s| s.trim().to_string()) {
        Some(id) if !id.is_empty() => id,
        _ => {
            warnings.push(MappingWarning::MissingId { entity, index });
            return None;
        }
    };
    if ImageId::new(id.as_str()).is_temporary() {
        warnings.push(MappingWarning::TemporaryId { entity, id });
        return None;
    }
    Some(id)
}

fn map_image(
    index: usize,
    record: ImageRecord,
    warnings: &mut Vec<MappingWarning>,
) -> Option<Image> {
    let id = canonical_id("image", index, record.id, warnings)?;

    let status = match record.status.as_deref().and_then(ImageStatus::parse) {
        Some(status) => status,
        None => {
            warnings.push(MappingWarning::UnknownStatus {
                entity: "image",
                id: id.clone(),
                value: record.status.clone(),
            });
            ImageStatus::Completed
        }
    };

    let client_ref = match record.client_ref {
        Some(raw) if ImageId::new(raw.as_str()).is_temporary() => Some(ImageId::new(raw)),
        Some(raw) => {
            warnings.push(MappingWarning::InvalidClientRef {
                image_id: id.clone(),
                client_ref: raw,
            });
            None
        }
        None => None,
    };

    let blob_ref = record.storage_path.map(|uri| BlobRef {
        uri,
        size_bytes: record.size_bytes.unwrap_or(0),
        content_hash: record.content_hash,
        content_type: record.content_type,
    });

    Some(Image {
        name: record.name.unwrap_or_else(|| id.clone()),
        id: ImageId::new(id),
        url: record.url,
        blob_ref,
        dimensions: Dimensions::new(record.width.unwrap_or(0), record.height.unwrap_or(0)),
        status,
        created_at: UnixTimeMs(record.created_at.unwrap_or(0)),
        client_ref,
    })
}

fn map_analysis(
    index: usize,
    record: AnalysisRecord,
    image_ids: &HashSet<&ImageId>,
    warnings: &mut Vec<MappingWarning>,
) -> Option<Analysis> {
    let id = canonical_id("analysis", index, record.id, warnings)?;

    let image_id = match record.image_id {
        Some(image_id) if image_ids.contains(&ImageId::new(image_id.as_str())) => image_id,
        other => {
            warnings.push(MappingWarning::MissingImageReference {
                analysis_id: id,
                image_id: other,
            });
            return None;
        }
    };

    let status = match record.status.as_deref().and_then(AnalysisStatus::parse) {
        Some(status) => status,
        None => {
            warnings.push(MappingWarning::UnknownStatus {
                entity: "analysis",
                id: id.clone(),
                value: record.status.clone(),
            });
            AnalysisStatus::Failed
        }
    };

    Some(Analysis {
        id: AnalysisId::new(id),
        image_id: ImageId::new(image_id),
        status,
        summary: record.summary.unwrap_or_default(),
        annotations: record.annotations.unwrap_or_default(),
        suggestions: record.suggestions.unwrap_or_default(),
    })
}

/// Maps local state into records for `migrate_all`. Temporary entities are
/// sent without an id and carry their temporary id as `client_ref`.
#[must_use]
pub fn records_from_state(state: &AppState) -> DatabaseSnapshot {
    let images = state
        .images
        .iter()
        .map(|image| {
            let (id, client_ref) = if image.id.is_temporary() {
                (None, Some(image.id.to_string()))
            } else {
                (
                    Some(image.id.to_string()),
                    image.client_ref.as_ref().map(ToString::to_string),
                )
            };
            ImageRecord {
                id,
                name: Some(image.name.clone()),
                url: image.url.clone(),
                storage_path: image.blob_ref.as_ref().map(|b| b.uri.clone()),
                size_bytes: image.blob_ref.as_ref().map(|b| b.size_bytes),
                content_hash: image.blob_ref.as_ref().and_then(|b| b.content_hash.clone()),
                content_type: image.blob_ref.as_ref().and_then(|b| b.content_type.clone()),
                width: image.dimensions.is_known().then_some(image.dimensions.width),
                height: image.dimensions.is_known().then_some(image.dimensions.height),
                status: Some(image.status.as_str().to_string()),
                created_at: Some(image.created_at.as_millis()),
                client_ref,
            }
        })
        .collect();

    let analyses = state
        .analyses
        .iter()
        .map(|analysis| AnalysisRecord {
            id: (!analysis.id.is_temporary()).then(|| analysis.id.to_string()),
            image_id: Some(analysis.image_id.to_string()),
            status: Some(analysis.status.as_str().to_string()),
            summary: Some(analysis.summary.clone()),
            annotations: Some(analysis.annotations.clone()),
            suggestions: Some(analysis.suggestions.clone()),
        })
        .collect();

    let groups = state
        .groups
        .iter()
        .map(|group| GroupRecord {
            id: Some(group.id.to_string()),
            name: Some(group.name.clone()),
            image_ids: Some(group.image_ids.iter().map(ToString::to_string).collect()),
        })
        .collect();

    let group_analyses = state
        .group_analyses
        .iter()
        .map(|ga| GroupAnalysisRecord {
            id: Some(ga.id.to_string()),
            group_id: Some(ga.group_id.to_string()),
            summary: Some(ga.summary.clone()),
            insights: Some(ga.insights.clone()),
        })
        .collect();

    let concepts = state
        .concepts
        .iter()
        .map(|c| ConceptRecord {
            id: Some(c.id.to_string()),
            group_id: c.group_id.as_ref().map(ToString::to_string),
            title: Some(c.title.clone()),
            description: Some(c.description.clone()),
        })
        .collect();

    DatabaseSnapshot {
        images,
        analyses,
        groups,
        group_analyses,
        concepts,
    }
}
