use std::collections::HashSet;

use proptest::prelude::*;
use uxlens_core::model::Dimensions;
use uxlens_core::{
    Action, Analysis, AnalysisPatch, AnalysisStatus, EntityId, Image, ImageId, ImagePatch,
    ImageStatus, MergeOptions, RemoteSnapshot, Store, UnixTimeMs,
};

const IDS: &[&str] = &["temp-1", "temp-2", "img-1", "img-2", "img-3"];

fn image_id() -> impl Strategy<Value = ImageId> {
    prop::sample::select(IDS).prop_map(ImageId::new)
}

fn image_status() -> impl Strategy<Value = ImageStatus> {
    prop::sample::select(vec![
        ImageStatus::Uploading,
        ImageStatus::Processing,
        ImageStatus::Analyzing,
        ImageStatus::Completed,
        ImageStatus::Error,
    ])
}

fn image(id: ImageId) -> Image {
    Image::placeholder(id.clone(), id.as_str(), Dimensions::new(8, 8), None, None)
}

fn remote_snapshot() -> impl Strategy<Value = RemoteSnapshot> {
    (
        prop::collection::btree_set(prop::sample::select(&IDS[2..]), 0..3),
        prop::option::of(prop::sample::select(&IDS[..2])),
        any::<u32>(),
    )
        .prop_map(|(ids, client_ref, at)| {
            let mut images: Vec<Image> = ids
                .into_iter()
                .map(|id| {
                    let mut image = image(ImageId::new(id));
                    image.status = ImageStatus::Completed;
                    image
                })
                .collect();
            if let (Some(first), Some(temp)) = (images.first_mut(), client_ref) {
                first.client_ref = Some(ImageId::new(temp));
            }
            let analyses = images
                .iter()
                .map(|i| Analysis {
                    status: AnalysisStatus::Completed,
                    ..Analysis::placeholder(i.id.clone())
                })
                .collect();
            RemoteSnapshot {
                images,
                analyses,
                fetched_at: UnixTimeMs(u64::from(at)),
                ..RemoteSnapshot::default()
            }
        })
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        image_id().prop_map(|id| Action::AddImages(vec![image(id)])),
        image_id().prop_map(Action::RemoveImage),
        (image_id(), image_status()).prop_map(|(id, status)| Action::UpdateImage {
            id,
            patch: ImagePatch::status(status),
        }),
        image_id().prop_map(|image_id| Action::UpdateAnalysis {
            image_id,
            patch: AnalysisPatch::status(AnalysisStatus::Completed),
        }),
        prop::option::of(image_id()).prop_map(Action::SelectImage),
        image_id().prop_map(|id| Action::BatchUpload {
            images: vec![image(id.clone())],
            analyses: vec![Analysis::placeholder(id)],
        }),
        image_id().prop_map(|id| Action::AddPendingSync(vec![EntityId::from(id)])),
        image_id().prop_map(|id| Action::RemovePendingSync(vec![EntityId::from(id)])),
        any::<bool>().prop_map(Action::SetUploading),
        (remote_snapshot(), any::<bool>()).prop_map(|(snapshot, force)| {
            let options = if force {
                MergeOptions::FORCE_REPLACE
            } else {
                MergeOptions::GATED
            };
            Action::merge(snapshot, options)
        }),
        Just(Action::ResetState),
    ]
}

proptest! {
    #[test]
    fn reachable_states_stay_consistent(actions in prop::collection::vec(action(), 1..40)) {
        let store = Store::default();

        for action in actions {
            let reset = matches!(action, Action::ResetState);
            let before = store.state();
            let changed = store.dispatch(action);
            let after = store.state();

            // Version moves exactly when content does
            if reset {
                prop_assert_eq!(after.version.get(), 0);
            } else if changed {
                prop_assert_eq!(after.version.get(), before.version.get() + 1);
            } else {
                prop_assert!(std::sync::Arc::ptr_eq(&before, &after));
            }

            prop_assert_eq!(after.dangling_analyses().count(), 0);

            let ids: HashSet<&ImageId> = after.images.iter().map(|i| &i.id).collect();
            prop_assert_eq!(ids.len(), after.images.len());

            if let Some(selected) = &after.selected_image_id {
                prop_assert!(after.contains_image(selected));
            }
        }
    }

    #[test]
    fn gated_merge_never_touches_pending_state(
        pending in image_id(),
        snapshot in remote_snapshot(),
    ) {
        let store = Store::default();
        store.dispatch(Action::AddImages(vec![image(pending.clone())]));
        store.dispatch(Action::AddPendingSync(vec![EntityId::from(&pending)]));
        let before = store.state();

        prop_assert!(!store.dispatch(Action::merge(snapshot, MergeOptions::GATED)));
        prop_assert!(std::sync::Arc::ptr_eq(&before, &store.state()));
    }
}
