use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::merge;
use crate::model::{Analysis, AppState, Image, ImageId};
use crate::store::StoreError;

/// Pure transition function. Rejected, deferred and content-neutral actions
/// return the same `Arc`; every other action bumps the version by one.
#[must_use]
pub fn reduce(state: Arc<AppState>, action: Action) -> Arc<AppState> {
    let name = action.name();
    match transition(&state, action) {
        Ok(next) => next,
        Err(StoreError::Deferred(reason)) => {
            info!(action = name, %reason, "action deferred");
            state
        }
        Err(err) => {
            warn!(action = name, error = %err, "action rejected");
            state
        }
    }
}

/// Like [`reduce`] but reports why an action left the state untouched.
pub fn transition(state: &Arc<AppState>, action: Action) -> Result<Arc<AppState>, StoreError> {
    if matches!(action, Action::ResetState) {
        return Ok(if **state == AppState::default() {
            Arc::clone(state)
        } else {
            Arc::new(AppState::default())
        });
    }

    let name = action.name();
    let mut next = AppState::clone(state);
    apply(&mut next, action)?;

    if next.same_content(state) {
        debug!(action = name, "content-neutral action");
        return Ok(Arc::clone(state));
    }

    next.version = state.version;
    next.version.bump();
    Ok(Arc::new(next))
}

fn apply(state: &mut AppState, action: Action) -> Result<(), StoreError> {
    match action {
        Action::AddImages(images) => {
            for image in images {
                require_id(image.id.as_str(), "image")?;
                if !state.contains_image(&image.id) {
                    state.images.push(image);
                }
            }
        }

        Action::UpdateImage { id, patch } => {
            let image = state
                .images
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| unknown("image", id.as_str()))?;
            patch.apply(image);
        }

        Action::RemoveImage(id) => {
            let before = state.images.len();
            state.images.retain(|i| i.id != id);
            if state.images.len() == before {
                return Err(unknown("image", id.as_str()));
            }
            state.analyses.retain(|a| a.image_id != id);
            for group in &mut state.groups {
                group.image_ids.retain(|member| member != &id);
            }
            if state.selected_image_id.as_ref() == Some(&id) {
                state.selected_image_id = state.images.first().map(|i| i.id.clone());
            }
        }

        Action::UpdateAnalysis { image_id, patch } => {
            if !state.contains_image(&image_id) {
                return Err(unknown("image", image_id.as_str()));
            }
            match state.analyses.iter_mut().find(|a| a.image_id == image_id) {
                Some(analysis) => patch.apply(analysis),
                None => {
                    let mut analysis = Analysis::placeholder(image_id);
                    patch.apply(&mut analysis);
                    state.analyses.push(analysis);
                }
            }
        }

        Action::SelectImage(selection) => {
            if let Some(id) = &selection {
                if !state.contains_image(id) {
                    return Err(unknown("image", id.as_str()));
                }
            }
            state.selected_image_id = selection;
        }

        Action::SetGroups(groups) => {
            for group in &groups {
                require_id(group.id.as_str(), "group")?;
            }
            state.groups = groups;
        }

        Action::UpsertGroup(group) => {
            require_id(group.id.as_str(), "group")?;
            match state.groups.iter_mut().find(|g| g.id == group.id) {
                Some(existing) => *existing = group,
                None => state.groups.push(group),
            }
        }

        Action::RemoveGroup(id) => {
            let before = state.groups.len();
            state.groups.retain(|g| g.id != id);
            if state.groups.len() == before {
                return Err(unknown("group", id.as_str()));
            }
            state.group_analyses.retain(|ga| ga.group_id != id);
            for concept in &mut state.concepts {
                if concept.group_id.as_ref() == Some(&id) {
                    concept.group_id = None;
                }
            }
        }

        Action::SetGroupAnalyses(group_analyses) => {
            for ga in &group_analyses {
                require_id(ga.id.as_str(), "group analysis")?;
            }
            state.group_analyses = group_analyses;
        }

        Action::SetConcepts(concepts) => {
            for concept in &concepts {
                require_id(concept.id.as_str(), "concept")?;
            }
            state.concepts = concepts;
        }

        Action::BatchUpload { images, analyses } => batch_upload(state, images, analyses)?,

        Action::AddPendingSync(ids) => {
            for id in ids {
                require_id(id.as_str(), "pending entity")?;
                state.pending_sync.insert(id);
            }
        }

        Action::RemovePendingSync(ids) => {
            for id in &ids {
                state.pending_sync.remove(id);
            }
        }

        Action::SetUploading(flag) => state.is_uploading = flag,
        Action::SetSyncing(flag) => state.is_syncing = flag,
        Action::MarkSynced(at) => state.last_sync_timestamp = Some(at),

        Action::MergeFromDatabase { snapshot, options } => {
            merge::merge_into(state, *snapshot, options)?;
        }

        Action::RestoreSession(restored) => {
            let version = state.version;
            *state = *restored;
            state.version = version;
            prune_dangling(state);
        }

        Action::ResetState => *state = AppState::default(),
    }
    Ok(())
}

fn batch_upload(
    state: &mut AppState,
    images: Vec<Image>,
    analyses: Vec<Analysis>,
) -> Result<(), StoreError> {
    let mut batch_ids: HashSet<ImageId> = HashSet::with_capacity(images.len());
    for image in &images {
        require_id(image.id.as_str(), "image")?;
        batch_ids.insert(image.id.clone());
    }

    // Reject the whole batch before touching state.
    for analysis in &analyses {
        require_id(analysis.id.as_str(), "analysis")?;
        if !batch_ids.contains(&analysis.image_id) && !state.contains_image(&analysis.image_id) {
            return Err(StoreError::Validation(format!(
                "analysis {} references unknown image {}",
                analysis.id, analysis.image_id
            )));
        }
    }

    let mut first_added: Option<ImageId> = None;
    for image in images {
        if state.contains_image(&image.id) {
            continue;
        }
        if first_added.is_none() {
            first_added = Some(image.id.clone());
        }
        state.images.push(image);
    }

    for analysis in analyses {
        if state.analyses.iter().any(|a| a.id == analysis.id) {
            continue;
        }
        state.analyses.push(analysis);
    }

    if state.selected_image_id.is_none() {
        state.selected_image_id = first_added;
    }
    Ok(())
}

/// Drops analyses whose image is gone. Returns how many were removed.
pub(crate) fn prune_dangling(state: &mut AppState) -> usize {
    let image_ids: HashSet<&ImageId> = state.images.iter().map(|i| &i.id).collect();
    let before = state.analyses.len();
    state.analyses.retain(|a| image_ids.contains(&a.image_id));
    before - state.analyses.len()
}

fn require_id(id: &str, entity: &str) -> Result<(), StoreError> {
    if id.trim().is_empty() {
        return Err(StoreError::Validation(format!("{entity} id is empty")));
    }
    Ok(())
}

fn unknown(entity: &str, id: &str) -> StoreError {
    StoreError::Validation(format!("unknown {entity} id {id:?}"))
}
