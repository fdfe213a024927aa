//! Reconciliation of local state against an authoritative remote snapshot.
//!
//! Local work the server has not observed yet always survives: images with
//! temporary ids, images the snapshot does not list, and local-only fields
//! such as blob references. A temporary image is replaced by the remote
//! record whose `client_ref` names it.

use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::action::MergeOptions;
use crate::model::{
    Analysis, AppState, Concept, Group, GroupAnalysis, Image, ImageId, UnixTimeMs,
};
use crate::reducer::prune_dangling;
use crate::store::StoreError;

/// Domain-typed view of the remote database at `fetched_at`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteSnapshot {
    pub images: Vec<Image>,
    pub analyses: Vec<Analysis>,
    pub groups: Vec<Group>,
    pub group_analyses: Vec<GroupAnalysis>,
    pub concepts: Vec<Concept>,
    pub fetched_at: UnixTimeMs,
}

pub(crate) fn merge_into(
    state: &mut AppState,
    snapshot: RemoteSnapshot,
    options: MergeOptions,
) -> Result<(), StoreError> {
    if options.force_replace {
        replace(state, snapshot);
        return Ok(());
    }

    if !state.pending_sync.is_empty() || state.is_uploading {
        return Err(StoreError::Deferred(format!(
            "{} entities pending sync, uploading={}",
            state.pending_sync.len(),
            state.is_uploading
        )));
    }

    let RemoteSnapshot {
        images: remote_images,
        analyses: remote_analyses,
        groups,
        group_analyses,
        concepts,
        fetched_at,
    } = snapshot;

    let promotions = promotions(&state.images, &remote_images);
    let local_images = std::mem::take(&mut state.images);
    state.images = merge_images(local_images, remote_images, &promotions);

    let local_analyses = std::mem::take(&mut state.analyses);
    state.analyses = merge_analyses(local_analyses, remote_analyses, &promotions);
    let pruned = prune_dangling(state);
    if pruned > 0 {
        warn!(pruned, "dropped analyses referencing no merged image");
    }

    state.groups = groups;
    state.group_analyses = group_analyses;
    state.concepts = concepts;

    if let Some(selected) = &state.selected_image_id {
        if let Some(canonical) = promotions.get(selected) {
            state.selected_image_id = Some(canonical.clone());
        }
    }
    fix_selection(state);
    state.last_sync_timestamp = Some(fetched_at);

    if !promotions.is_empty() {
        info!(promoted = promotions.len(), "promoted temporary images");
    }
    Ok(())
}

fn replace(state: &mut AppState, snapshot: RemoteSnapshot) {
    state.images = snapshot.images;
    state.analyses = snapshot.analyses;
    state.groups = snapshot.groups;
    state.group_analyses = snapshot.group_analyses;
    state.concepts = snapshot.concepts;
    state.pending_sync.clear();
    state.last_sync_timestamp = Some(snapshot.fetched_at);

    let pruned = prune_dangling(state);
    if pruned > 0 {
        warn!(pruned, "remote snapshot carried analyses without images");
    }
    fix_selection(state);
    debug!(images = state.images.len(), "local state replaced by remote snapshot");
}

/// Maps each local temporary id to the canonical id of the remote record
/// created from it.
fn promotions(local: &[Image], remote: &[Image]) -> HashMap<ImageId, ImageId> {
    let local_temp: HashSet<&ImageId> = local
        .iter()
        .filter(|i| i.id.is_temporary())
        .map(|i| &i.id)
        .collect();

    remote
        .iter()
        .filter_map(|r| {
            let client_ref = r.client_ref.as_ref()?;
            (client_ref != &r.id && local_temp.contains(client_ref))
                .then(|| (client_ref.clone(), r.id.clone()))
        })
        .collect()
}

fn merge_images(
    local: Vec<Image>,
    remote: Vec<Image>,
    promotions: &HashMap<ImageId, ImageId>,
) -> Vec<Image> {
    let remote_ids: HashSet<&ImageId> = remote.iter().map(|r| &r.id).collect();

    let mut unknown = Vec::new();
    let mut counterparts: HashMap<ImageId, Image> = HashMap::new();
    for image in local {
        if let Some(canonical) = promotions.get(&image.id) {
            counterparts.insert(canonical.clone(), image);
        } else if remote_ids.contains(&image.id) {
            counterparts.entry(image.id.clone()).or_insert(image);
        } else {
            unknown.push(image);
        }
    }

    let mut merged = unknown;
    merged.reserve(remote.len());
    for mut image in remote {
        if let Some(local) = counterparts.remove(&image.id) {
            if image.blob_ref.is_none() {
                image.blob_ref = local.blob_ref;
            }
            if image.url.is_none() {
                image.url = local.url;
            }
            if !image.dimensions.is_known() && local.dimensions.is_known() {
                image.dimensions = local.dimensions;
            }
        }
        merged.push(image);
    }
    merged
}

fn merge_analyses(
    local: Vec<Analysis>,
    remote: Vec<Analysis>,
    promotions: &HashMap<ImageId, ImageId>,
) -> Vec<Analysis> {
    if local.is_empty() {
        return remote;
    }

    let covered: HashSet<ImageId> = remote.iter().map(|a| a.image_id.clone()).collect();
    let mut merged = remote;
    for mut analysis in local {
        if let Some(canonical) = promotions.get(&analysis.image_id) {
            analysis.image_id = canonical.clone();
        }
        if !covered.contains(&analysis.image_id) {
            merged.push(analysis);
        }
    }
    merged
}

fn fix_selection(state: &mut AppState) {
    let valid = state
        .selected_image_id
        .as_ref()
        .is_some_and(|id| state.contains_image(id));
    if !valid {
        state.selected_image_id = state.images.first().map(|i| i.id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::model::{AnalysisStatus, BlobRef, Dimensions, EntityId, ImageStatus};
    use crate::reducer::reduce;
    use std::sync::Arc;

    fn image(id: &str, status: ImageStatus) -> Image {
        let mut image =
            Image::placeholder(ImageId::new(id), id, Dimensions::new(0, 0), None, None);
        image.status = status;
        image
    }

    fn analysis(id: &str, image_id: &str, status: AnalysisStatus) -> Analysis {
        let mut a = Analysis::placeholder(ImageId::new(image_id));
        a.id = id.into();
        a.status = status;
        a
    }

    fn local_with_temp() -> AppState {
        let mut temp = image("temp-1", ImageStatus::Analyzing);
        temp.dimensions = Dimensions::new(640, 480);
        temp.blob_ref = Some(BlobRef {
            uri: "blob:local/1".into(),
            size_bytes: 1024,
            content_hash: None,
            content_type: Some("image/png".into()),
        });
        AppState {
            images: vec![temp, image("srv-9", ImageStatus::Completed)],
            analyses: vec![analysis("temp-an-1", "temp-1", AnalysisStatus::Processing)],
            selected_image_id: Some(ImageId::new("temp-1")),
            ..AppState::default()
        }
    }

    fn remote_with_promotion() -> RemoteSnapshot {
        let mut promoted = image("srv-1", ImageStatus::Completed);
        promoted.client_ref = Some(ImageId::new("temp-1"));
        promoted.url = Some("https://cdn.example/srv-1.png".into());
        RemoteSnapshot {
            images: vec![promoted, image("srv-2", ImageStatus::Completed)],
            analyses: vec![analysis("an-2", "srv-2", AnalysisStatus::Completed)],
            fetched_at: UnixTimeMs(1_700_000_000_000),
            ..RemoteSnapshot::default()
        }
    }

    #[test]
    fn promotion_replaces_temp_and_keeps_local_fields() {
        let mut state = local_with_temp();
        merge_into(&mut state, remote_with_promotion(), MergeOptions::GATED).unwrap();

        let ids: Vec<_> = state.images.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["srv-9", "srv-1", "srv-2"]);

        let promoted = state.image(&ImageId::new("srv-1")).unwrap();
        assert_eq!(promoted.dimensions, Dimensions::new(640, 480));
        assert!(promoted.blob_ref.is_some());
        assert_eq!(promoted.url.as_deref(), Some("https://cdn.example/srv-1.png"));
        assert_eq!(promoted.status, ImageStatus::Completed);

        // Local analysis follows the promotion since the remote has none for srv-1.
        assert_eq!(
            state.analysis_for(&ImageId::new("srv-1")).map(|a| a.id.as_str()),
            Some("temp-an-1")
        );
        assert_eq!(state.selected_image_id, Some(ImageId::new("srv-1")));
        assert_eq!(state.last_sync_timestamp, Some(UnixTimeMs(1_700_000_000_000)));
    }

    #[test]
    fn gate_defers_while_pending() {
        let mut state = local_with_temp();
        state.pending_sync.insert(EntityId::new("temp-1"));
        let err = merge_into(&mut state, remote_with_promotion(), MergeOptions::GATED)
            .unwrap_err();
        assert!(matches!(err, StoreError::Deferred(_)));
    }

    #[test]
    fn force_replace_takes_remote_and_clears_pending() {
        let mut state = local_with_temp();
        state.pending_sync.insert(EntityId::new("temp-1"));
        merge_into(&mut state, remote_with_promotion(), MergeOptions::FORCE_REPLACE).unwrap();

        assert_eq!(state.images.len(), 2);
        assert!(state.pending_sync.is_empty());
        assert_eq!(state.analyses.len(), 1);
        assert_eq!(state.selected_image_id, Some(ImageId::new("srv-1")));
    }

    #[test]
    fn remote_analysis_wins_for_covered_image() {
        let mut state = AppState {
            images: vec![image("srv-2", ImageStatus::Analyzing)],
            analyses: vec![analysis("local-an", "srv-2", AnalysisStatus::Processing)],
            ..AppState::default()
        };
        merge_into(&mut state, remote_with_promotion(), MergeOptions::GATED).unwrap();
        let a = state.analysis_for(&ImageId::new("srv-2")).unwrap();
        assert_eq!(a.id.as_str(), "an-2");
        assert_eq!(state.analyses.len(), 1);
    }

    #[test]
    fn merging_twice_is_content_neutral() {
        let state = Arc::new(local_with_temp());
        let remote = remote_with_promotion();
        let once = reduce(state, Action::merge(remote.clone(), MergeOptions::GATED));
        let twice = reduce(Arc::clone(&once), Action::merge(remote, MergeOptions::GATED));
        assert!(Arc::ptr_eq(&once, &twice));
    }
}
