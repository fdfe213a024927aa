mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{png_file, FailableStorage, Harness};
use uxlens_core::capabilities::memory::MemoryPersistence;
use uxlens_core::{
    AnalysisStatus, AppError, EntityId, ErrorKind, ImageStatus, NoticeLevel, OperationStatus,
    SyncEvent,
};

#[tokio::test(start_paused = true)]
async fn upload_failing_every_attempt_ends_in_error() {
    let harness = Harness::with(FailableStorage::failing(), MemoryPersistence::new());
    let service = &harness.service;
    let mut events = service.events().subscribe();

    let report = service.upload(vec![png_file("broken-net.png")]).await.unwrap();
    let id = report.accepted[0].clone();
    let entity = EntityId::from(&id);

    let started = tokio::time::Instant::now();
    service.queue().drain().await;

    // 1. Three attempts with 2s then 4s of backoff between them
    assert_eq!(harness.storage.calls(), 3);
    assert!(started.elapsed() >= Duration::from_secs(6));

    // 2. Entity and operation are both terminal
    let state = service.state();
    assert_eq!(state.image(&id).unwrap().status, ImageStatus::Error);
    assert!(!state.pending_sync.contains(&entity));

    let ops = service.queue().operations_for(&entity).await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].status, OperationStatus::Failed);
    assert_eq!(ops[0].attempts, 3);
    assert_eq!(
        ops[0].last_error.as_ref().map(|e| e.code.as_str()),
        Some("NETWORK_ERROR")
    );

    // 3. Surfaced exactly once
    let mut failed = 0;
    let mut retried = 0;
    let mut notices = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::OperationFailed { operation, .. } => {
                assert_eq!(operation.entity_id, entity);
                failed += 1;
            }
            SyncEvent::OperationUpdated(op) if op.status == OperationStatus::Retrying => {
                retried += 1;
            }
            SyncEvent::Notice(notice) if notice.level == NoticeLevel::Error => {
                notices.push(notice.message);
            }
            _ => {}
        }
    }
    assert_eq!(failed, 1);
    assert_eq!(retried, 2);
    assert_eq!(
        notices,
        vec![AppError::new(ErrorKind::Network, "").user_facing_message()]
    );

    // 4. Never retried automatically afterwards
    tokio::time::sleep(Duration::from_secs(120)).await;
    service.queue().drain().await;
    assert_eq!(harness.storage.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn manual_retry_recovers_after_outage() {
    let harness = Harness::with(FailableStorage::failing(), MemoryPersistence::new());
    let service = &harness.service;

    let report = service.upload(vec![png_file("retry-me.png")]).await.unwrap();
    let id = report.accepted[0].clone();
    service.queue().drain().await;
    assert_eq!(service.state().image(&id).unwrap().status, ImageStatus::Error);

    // Connectivity returns
    harness.storage.fail.store(false, Ordering::SeqCst);
    service.retry_image(&id).await.unwrap();

    let state = service.state();
    assert_eq!(state.image(&id).unwrap().status, ImageStatus::Uploading);
    assert!(state.pending_sync.contains(&EntityId::from(&id)));

    service.queue().drain().await;
    let state = service.state();
    assert_eq!(state.image(&id).unwrap().status, ImageStatus::Completed);
    assert_eq!(
        state.analysis_for(&id).map(|a| a.status),
        Some(AnalysisStatus::Completed)
    );
    assert!(state.pending_sync.is_empty());
    assert_eq!(harness.storage.calls(), 4);
}
