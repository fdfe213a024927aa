mod common;

use std::time::Duration;

use common::{png_file, FailableStorage, Harness};
use uxlens_core::capabilities::memory::MemoryPersistence;
use uxlens_core::{
    AnalysisStatus, EntityId, ImageStatus, OperationKind, OperationStatus, SyncEvent,
    SyncOutcome, UploadFile,
};

#[tokio::test(start_paused = true)]
async fn single_upload_reaches_completed() {
    let harness = Harness::new();
    let service = &harness.service;
    let mut events = service.events().subscribe();

    // 1. Optimistic placeholders land before any background work runs
    let report = service.upload(vec![png_file("landing.png")]).await.unwrap();
    assert_eq!(report.accepted.len(), 1);
    let temp_id = report.accepted[0].clone();
    let entity = EntityId::from(&temp_id);

    let state = service.state();
    assert_eq!(state.images.len(), 1);
    assert_eq!(state.analyses.len(), 1);
    assert_eq!(state.images[0].status, ImageStatus::Uploading);
    assert_eq!(state.analyses[0].status, AnalysisStatus::Processing);
    assert_eq!(state.pending_sync.len(), 1);
    assert!(state.pending_sync.contains(&entity));
    assert!(!state.is_uploading);

    // 2. Upload then analysis run to completion
    service.queue().drain().await;

    let state = service.state();
    let image = state.image(&temp_id).unwrap();
    assert_eq!(image.status, ImageStatus::Completed);
    assert!(image
        .url
        .as_deref()
        .is_some_and(|url| url.starts_with("memory://blobs/uploads/temp-")));
    let analysis = state.analysis_for(&temp_id).unwrap();
    assert_eq!(analysis.status, AnalysisStatus::Completed);
    assert_eq!(analysis.suggestions.len(), 1);
    assert!(state.pending_sync.is_empty());
    assert_eq!(harness.storage.calls(), 1);
    assert_eq!(harness.analysis.call_count(), 1);

    // 3. Both operations reported completion
    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::OperationCompleted(op) = event {
            completed.push(op.kind);
        }
    }
    assert_eq!(
        completed,
        vec![OperationKind::UploadImage, OperationKind::RequestAnalysis]
    );
    assert!(service
        .queue()
        .operations_for(&entity)
        .await
        .iter()
        .all(|op| op.status == OperationStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn undecodable_file_does_not_block_batch() {
    let harness = Harness::new();
    let service = &harness.service;

    let report = service
        .upload(vec![
            png_file("a.png"),
            UploadFile::new("corrupt.png", &b"not an image"[..]),
            png_file("b.png"),
        ])
        .await
        .unwrap();

    assert_eq!(report.accepted.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].name, "corrupt.png");

    // One batch dispatch selected the first surviving image
    let state = service.state();
    assert_eq!(state.images.len(), 2);
    assert_eq!(state.selected_image_id.as_ref(), Some(&report.accepted[0]));

    service.queue().drain().await;
    let state = service.state();
    assert!(state
        .images
        .iter()
        .all(|i| i.status == ImageStatus::Completed));
    assert!(state.pending_sync.is_empty());
}

#[tokio::test(start_paused = true)]
async fn removing_image_cancels_its_queued_upload() {
    let harness = Harness::new();
    let service = &harness.service;

    let report = service.upload(vec![png_file("draft.png")]).await.unwrap();
    let id = report.accepted[0].clone();

    service.remove_image(&id).await.unwrap();
    let state = service.state();
    assert!(state.images.is_empty());
    assert!(state.analyses.is_empty());
    assert!(state.pending_sync.is_empty());

    service.queue().drain().await;
    assert_eq!(harness.storage.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn removing_image_mid_upload_starts_no_analysis() {
    let harness = Harness::with(
        FailableStorage::slow(Duration::from_secs(5)),
        MemoryPersistence::new(),
    );
    let service = &harness.service;

    let report = service.upload(vec![png_file("wip.png")]).await.unwrap();
    let id = report.accepted[0].clone();
    let entity = EntityId::from(&id);

    // 1. The upload is in flight when the image is removed
    assert_eq!(service.queue().tick().await, 1);
    service.remove_image(&id).await.unwrap();
    assert!(service.state().images.is_empty());
    assert!(service.queue().operations_for(&entity).await.is_empty());

    // 2. It finishes without queueing analysis for the removed image
    service.queue().drain().await;
    assert_eq!(harness.storage.calls(), 1);
    assert_eq!(harness.analysis.call_count(), 0);
    assert!(service.queue().operations_for(&entity).await.is_empty());

    let state = service.state();
    assert!(state.images.is_empty());
    assert!(state.pending_sync.is_empty());

    // 3. Nothing holds back the next pull
    let outcome = service.sync_now().await.unwrap();
    assert!(!matches!(outcome, SyncOutcome::Deferred { .. }));
}
