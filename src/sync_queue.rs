use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::action::{Action, AnalysisPatch};
use crate::config::QueueConfig;
use crate::error::{AppError, ErrorKind};
use crate::event::{EventBus, Notification, SyncEvent};
use crate::model::{AnalysisStatus, EntityId, ImageStatus, UnixTimeMs};
use crate::retry::{OperationError, RetryPolicy};
use crate::runner::{OperationOutcome, OperationRunner};
use crate::store::Store;

/// Entity id under which whole-state batch syncs are tracked.
pub const BATCH_SYNC_ENTITY: &str = "batch-sync";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    UploadImage,
    RequestAnalysis,
    ExtractMetadata,
    BatchSync,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UploadImage => "upload_image",
            Self::RequestAnalysis => "request_analysis",
            Self::ExtractMetadata => "extract_metadata",
            Self::BatchSync => "batch_sync",
        }
    }

    /// Actions dispatched when an operation of this kind fails for good.
    /// Metadata refreshes leave the image status alone.
    fn failure_actions(self, entity_id: &EntityId) -> Vec<Action> {
        let image_id = entity_id.to_image_id();
        match self {
            Self::UploadImage => vec![Action::update_image_status(image_id, ImageStatus::Error)],
            Self::RequestAnalysis => vec![
                Action::UpdateAnalysis {
                    image_id: image_id.clone(),
                    patch: AnalysisPatch::status(AnalysisStatus::Failed),
                },
                Action::update_image_status(image_id, ImageStatus::Error),
            ],
            Self::ExtractMetadata => Vec::new(),
            Self::BatchSync => vec![Action::SetSyncing(false)],
        }
    }

    /// Actions that put the entity back into its in-progress state on
    /// manual retry.
    fn rearm_actions(self, entity_id: &EntityId) -> Vec<Action> {
        let image_id = entity_id.to_image_id();
        match self {
            Self::UploadImage => {
                vec![Action::update_image_status(image_id, ImageStatus::Uploading)]
            }
            Self::RequestAnalysis => vec![
                Action::UpdateAnalysis {
                    image_id: image_id.clone(),
                    patch: AnalysisPatch::status(AnalysisStatus::Processing),
                },
                Action::update_image_status(image_id, ImageStatus::Analyzing),
            ],
            Self::ExtractMetadata => Vec::new(),
            Self::BatchSync => vec![Action::SetSyncing(true)],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq)]
pub enum OperationPayload {
    UploadImage {
        bytes: Bytes,
        path: String,
        content_type: String,
    },
    RequestAnalysis {
        image_url: String,
        context: Option<String>,
    },
    ExtractMetadata {
        bytes: Bytes,
    },
    BatchSync,
}

impl OperationPayload {
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::UploadImage { .. } => OperationKind::UploadImage,
            Self::RequestAnalysis { .. } => OperationKind::RequestAnalysis,
            Self::ExtractMetadata { .. } => OperationKind::ExtractMetadata,
            Self::BatchSync => OperationKind::BatchSync,
        }
    }
}

// Payload bytes stay out of logs.
impl fmt::Debug for OperationPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UploadImage {
                bytes,
                path,
                content_type,
            } => f
                .debug_struct("UploadImage")
                .field("len", &bytes.len())
                .field("path", path)
                .field("content_type", content_type)
                .finish(),
            Self::RequestAnalysis { image_url, context } => f
                .debug_struct("RequestAnalysis")
                .field("image_url", image_url)
                .field("context", context)
                .finish(),
            Self::ExtractMetadata { bytes } => f
                .debug_struct("ExtractMetadata")
                .field("len", &bytes.len())
                .finish(),
            Self::BatchSync => f.write_str("BatchSync"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub entity_id: EntityId,
    pub status: OperationStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub payload: OperationPayload,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
    pub last_error: Option<OperationError>,
    /// Creation order, used for oldest-first scheduling.
    pub seq: u64,
}

impl SyncOperation {
    pub(crate) fn new(
        entity_id: EntityId,
        payload: OperationPayload,
        max_attempts: u32,
        seq: u64,
    ) -> Self {
        let now = UnixTimeMs::now();
        Self {
            id: OperationId::generate(),
            kind: payload.kind(),
            entity_id,
            status: OperationStatus::Pending,
            attempts: 0,
            max_attempts,
            payload,
            created_at: now,
            updated_at: now,
            last_error: None,
            seq,
        }
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            entity_id: self.entity_id.clone(),
            status: self.status,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_error: self.last_error.clone(),
            seq: self.seq,
        }
    }
}

/// Payload-free view of an operation for events and observability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub id: OperationId,
    pub kind: OperationKind,
    pub entity_id: EntityId,
    pub status: OperationStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
    pub last_error: Option<OperationError>,
    pub seq: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub active: usize,
    pub by_kind: HashMap<OperationKind, usize>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("sync queue is full ({0} operations)")]
    Full(usize),

    #[error("invalid entity id: {0:?}")]
    InvalidEntity(String),

    #[error("operation not found: {0}")]
    NotFound(String),

    #[error("operation {id} is {status}, expected {expected}")]
    InvalidState {
        id: String,
        status: OperationStatus,
        expected: &'static str,
    },
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        let kind = match &err {
            QueueError::Full(_) => ErrorKind::QuotaExceeded,
            QueueError::InvalidEntity(_) => ErrorKind::Validation,
            QueueError::NotFound(_) => ErrorKind::NotFound,
            QueueError::InvalidState { .. } => ErrorKind::Conflict,
        };
        let app_error = AppError::new(kind, err.to_string());
        match err {
            QueueError::NotFound(id) => app_error.with_context("op_id", id),
            QueueError::InvalidState { id, status, .. } => app_error
                .with_context("op_id", id)
                .with_context("status", status.as_str()),
            QueueError::Full(_) | QueueError::InvalidEntity(_) => app_error,
        }
    }
}

// ============================================================================
// Queue state
// ============================================================================

#[derive(Default)]
struct QueueState {
    operations: HashMap<OperationId, SyncOperation>,
    /// Operations whose body is currently running.
    active: HashSet<OperationId>,
    /// Running operations removed by `clear` or `cancel_entity`; they finish
    /// without follow-ups.
    detached: HashMap<OperationId, EntityId>,
    next_seq: u64,
}

impl QueueState {
    fn insert(
        &mut self,
        entity_id: EntityId,
        payload: OperationPayload,
        max_attempts: u32,
    ) -> OperationSnapshot {
        self.next_seq += 1;
        let op = SyncOperation::new(entity_id, payload, max_attempts, self.next_seq);
        let snapshot = op.snapshot();
        self.operations.insert(op.id.clone(), op);
        snapshot
    }

    fn begin(&mut self, id: &OperationId) -> Option<SyncOperation> {
        let record = self.operations.get_mut(id)?;
        record.status = OperationStatus::Processing;
        record.updated_at = UnixTimeMs::now();
        let op = record.clone();
        self.active.insert(id.clone());
        Some(op)
    }

    fn outstanding_for(&self, entity_id: &EntityId) -> bool {
        self.operations
            .values()
            .any(|o| &o.entity_id == entity_id && !o.status.is_terminal())
            || self.detached.values().any(|e| e == entity_id)
    }

    fn live_count(&self) -> usize {
        self.operations
            .values()
            .filter(|o| !o.status.is_terminal())
            .count()
    }

    /// Drops the oldest failed records beyond `keep`. Returns how many went.
    fn prune_failed(&mut self, keep: usize) -> usize {
        let mut failed: Vec<(u64, OperationId)> = self
            .operations
            .values()
            .filter(|o| o.status == OperationStatus::Failed)
            .map(|o| (o.seq, o.id.clone()))
            .collect();
        if failed.len() <= keep {
            return 0;
        }
        failed.sort_unstable();
        let excess = failed.len() - keep;
        for (_, id) in failed.into_iter().take(excess) {
            self.operations.remove(&id);
        }
        excess
    }
}

struct QueueInner {
    state: RwLock<QueueState>,
    store: Store,
    runner: Arc<dyn OperationRunner>,
    events: EventBus,
    config: QueueConfig,
    retry: RetryPolicy,
    changed: Notify,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded-concurrency background queue of sync operations.
///
/// Every change to the set of outstanding operations for an entity is
/// mirrored into the store's pending set under the queue lock.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

enum FailureOutcome {
    Retry(Duration, OperationSnapshot),
    Failed(OperationSnapshot),
}

impl SyncQueue {
    pub fn new(
        store: Store,
        runner: Arc<dyn OperationRunner>,
        events: EventBus,
        config: QueueConfig,
        retry: RetryPolicy,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                state: RwLock::new(QueueState::default()),
                store,
                runner,
                events,
                config,
                retry,
                changed: Notify::new(),
                shutdown,
                worker: Mutex::new(None),
            }),
        }
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.inner.config.tick_interval_ms)
    }

    #[instrument(
        skip(self, entity_id, payload),
        fields(entity_id = %entity_id, kind = payload.kind().as_str())
    )]
    pub async fn enqueue(
        &self,
        entity_id: EntityId,
        payload: OperationPayload,
    ) -> Result<OperationId, QueueError> {
        if entity_id.is_blank() {
            return Err(QueueError::InvalidEntity(entity_id.to_string()));
        }

        let snapshot = {
            let mut state = self.inner.state.write().await;

            if payload.kind() == OperationKind::BatchSync {
                if let Some(existing) = state.operations.values().find(|o| {
                    o.kind == OperationKind::BatchSync && o.status == OperationStatus::Pending
                }) {
                    debug!(op_id = %existing.id, "coalesced batch sync");
                    return Ok(existing.id.clone());
                }
            }

            let max = self.inner.config.max_operations;
            if state.live_count() >= max {
                warn!(max, "sync queue full");
                return Err(QueueError::Full(max));
            }

            let snapshot = state.insert(entity_id.clone(), payload, self.inner.retry.max_attempts);
            self.inner.store.dispatch(Action::AddPendingSync(vec![entity_id]));
            snapshot
        };

        info!(op_id = %snapshot.id, "operation enqueued");
        self.inner
            .events
            .publish(SyncEvent::OperationUpdated(snapshot.clone()));
        self.inner.changed.notify_one();
        Ok(snapshot.id)
    }

    /// Starts up to `concurrency_limit - active` pending operations, oldest
    /// first. Returns how many were started.
    pub async fn tick(&self) -> usize {
        let started: Vec<SyncOperation> = {
            let mut state = self.inner.state.write().await;
            let capacity = self
                .inner
                .config
                .concurrency_limit
                .saturating_sub(state.active.len());
            if capacity == 0 {
                return 0;
            }

            let mut due: Vec<(u64, OperationId)> = state
                .operations
                .values()
                .filter(|o| o.status == OperationStatus::Pending && !state.active.contains(&o.id))
                .map(|o| (o.seq, o.id.clone()))
                .collect();
            due.sort_unstable();
            due.truncate(capacity);

            due.into_iter()
                .filter_map(|(_, id)| state.begin(&id))
                .collect()
        };

        let count = started.len();
        for op in started {
            self.inner
                .events
                .publish(SyncEvent::OperationUpdated(op.snapshot()));
            self.spawn_execution(op);
        }
        count
    }

    /// Starts one pending operation immediately. Returns false if it is
    /// already running or not pending.
    pub async fn process_now(&self, id: &OperationId) -> Result<bool, QueueError> {
        let op = {
            let mut state = self.inner.state.write().await;
            if state.active.contains(id) {
                return Ok(false);
            }
            let record = state
                .operations
                .get(id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            if record.status != OperationStatus::Pending {
                return Ok(false);
            }
            state.begin(id)
        };

        match op {
            Some(op) => {
                self.inner
                    .events
                    .publish(SyncEvent::OperationUpdated(op.snapshot()));
                self.spawn_execution(op);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn spawn_execution(&self, op: SyncOperation) {
        let queue = self.clone();
        let span = info_span!("sync_operation", op_id = %op.id, kind = op.kind.as_str());
        tokio::spawn(
            async move {
                let result = queue.inner.runner.run(&op).await;
                match result {
                    Ok(outcome) => queue.complete(op, outcome).await,
                    Err(error) => queue.fail(op, error).await,
                }
                queue.inner.changed.notify_one();
            }
            .instrument(span),
        );
    }

    async fn complete(&self, op: SyncOperation, outcome: OperationOutcome) {
        let mut events = Vec::with_capacity(1 + outcome.follow_ups.len());
        let detached = {
            let mut state = self.inner.state.write().await;
            state.active.remove(&op.id);
            let detached = state.detached.remove(&op.id).is_some();

            let snapshot = match state.operations.get_mut(&op.id) {
                Some(record) => {
                    record.status = OperationStatus::Completed;
                    record.updated_at = UnixTimeMs::now();
                    record.last_error = None;
                    record.snapshot()
                }
                None => OperationSnapshot {
                    status: OperationStatus::Completed,
                    ..op.snapshot()
                },
            };
            events.push(SyncEvent::OperationCompleted(snapshot));

            for action in outcome.actions {
                // A detached batch sync belongs to a session that is gone.
                if detached && matches!(action, Action::MarkSynced(_)) {
                    continue;
                }
                self.inner.store.dispatch(action);
            }

            if detached {
                debug!(dropped = outcome.follow_ups.len(), "detached operation finished");
            } else {
                for payload in outcome.follow_ups {
                    let follow_up =
                        state.insert(op.entity_id.clone(), payload, self.inner.retry.max_attempts);
                    self.inner
                        .store
                        .dispatch(Action::AddPendingSync(vec![op.entity_id.clone()]));
                    events.push(SyncEvent::OperationUpdated(follow_up));
                }
            }

            if !state.outstanding_for(&op.entity_id) {
                self.inner
                    .store
                    .dispatch(Action::RemovePendingSync(vec![op.entity_id.clone()]));
            }
            detached
        };

        info!(attempts = op.attempts + 1, "operation completed");
        for event in events {
            self.inner.events.publish(event);
        }
        if !detached {
            self.schedule_gc(op.id);
        }
    }

    async fn fail(&self, op: SyncOperation, error: OperationError) {
        let outcome = {
            let mut state = self.inner.state.write().await;
            state.active.remove(&op.id);
            let detached = state.detached.remove(&op.id).is_some();

            let outcome = match state.operations.get_mut(&op.id) {
                Some(record) => {
                    record.attempts += 1;
                    record.last_error = Some(error.clone());
                    record.updated_at = UnixTimeMs::now();
                    if !detached && self.inner.retry.should_retry(&error, record.attempts) {
                        record.status = OperationStatus::Retrying;
                        FailureOutcome::Retry(
                            self.inner.retry.backoff(record.attempts),
                            record.snapshot(),
                        )
                    } else {
                        record.status = OperationStatus::Failed;
                        FailureOutcome::Failed(record.snapshot())
                    }
                }
                None => FailureOutcome::Failed(OperationSnapshot {
                    status: OperationStatus::Failed,
                    attempts: op.attempts + 1,
                    last_error: Some(error.clone()),
                    ..op.snapshot()
                }),
            };

            if matches!(outcome, FailureOutcome::Failed(_)) {
                let pruned = state.prune_failed(self.inner.config.max_failed_retained);
                if pruned > 0 {
                    debug!(pruned, "old failed operations dropped");
                }
                for action in op.kind.failure_actions(&op.entity_id) {
                    self.inner.store.dispatch(action);
                }
                if !state.outstanding_for(&op.entity_id) {
                    self.inner
                        .store
                        .dispatch(Action::RemovePendingSync(vec![op.entity_id.clone()]));
                }
            }
            outcome
        };

        match outcome {
            FailureOutcome::Retry(delay, snapshot) => {
                warn!(
                    attempts = snapshot.attempts,
                    delay_ms = delay.as_millis() as u64,
                    code = %error.code,
                    "operation failed, retrying"
                );
                self.inner
                    .events
                    .publish(SyncEvent::OperationUpdated(snapshot));
                self.schedule_requeue(op.id, delay);
            }
            FailureOutcome::Failed(snapshot) => {
                let app_error = AppError::new(ErrorKind::from_code(&error.code), &error.message)
                    .with_context("operation", snapshot.kind.as_str())
                    .with_context("entity_id", snapshot.entity_id.to_string());
                error!(
                    attempts = snapshot.attempts,
                    context = ?app_error.context,
                    "operation failed permanently: {}",
                    app_error
                );
                let notice = Notification::error("Sync failed", app_error.user_facing_message());
                self.inner.events.publish(SyncEvent::OperationFailed {
                    operation: snapshot,
                    error,
                });
                self.inner.events.notify(notice);
            }
        }
    }

    fn schedule_requeue(&self, id: OperationId, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let snapshot = {
                let mut state = queue.inner.state.write().await;
                match state.operations.get_mut(&id) {
                    Some(record) if record.status == OperationStatus::Retrying => {
                        record.status = OperationStatus::Pending;
                        record.updated_at = UnixTimeMs::now();
                        Some(record.snapshot())
                    }
                    _ => None,
                }
            };
            if let Some(snapshot) = snapshot {
                debug!(op_id = %snapshot.id, "operation re-queued");
                queue
                    .inner
                    .events
                    .publish(SyncEvent::OperationUpdated(snapshot));
                queue.inner.changed.notify_one();
            }
        });
    }

    fn schedule_gc(&self, id: OperationId) {
        let queue = self.clone();
        let grace = Duration::from_millis(self.inner.config.completed_grace_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut state = queue.inner.state.write().await;
            if state
                .operations
                .get(&id)
                .is_some_and(|o| o.status == OperationStatus::Completed)
            {
                state.operations.remove(&id);
                debug!(op_id = %id, "completed operation collected");
            }
        });
    }

    /// Removes a pending or retrying operation.
    #[instrument(skip(self, id), fields(op_id = %id))]
    pub async fn cancel(&self, id: &OperationId) -> Result<(), QueueError> {
        let mut state = self.inner.state.write().await;
        let record = state
            .operations
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if !matches!(
            record.status,
            OperationStatus::Pending | OperationStatus::Retrying
        ) || state.active.contains(id)
        {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                status: record.status,
                expected: "pending or retrying",
            });
        }

        let entity_id = record.entity_id.clone();
        state.operations.remove(id);
        if !state.outstanding_for(&entity_id) {
            self.inner
                .store
                .dispatch(Action::RemovePendingSync(vec![entity_id]));
        }
        info!("operation cancelled");
        Ok(())
    }

    /// Removes every pending or retrying operation for the entity. Running
    /// ones are detached: they finish, but start no follow-up work. Returns
    /// how many queued operations were removed.
    #[instrument(skip(self, entity_id), fields(entity_id = %entity_id))]
    pub async fn cancel_entity(&self, entity_id: &EntityId) -> usize {
        let mut state = self.inner.state.write().await;
        let records: Vec<(OperationId, OperationStatus)> = state
            .operations
            .values()
            .filter(|o| &o.entity_id == entity_id && !o.status.is_terminal())
            .map(|o| (o.id.clone(), o.status))
            .collect();

        let mut cancelled = 0;
        let mut detached = 0;
        for (id, status) in records {
            if state.active.contains(&id) {
                state.detached.insert(id.clone(), entity_id.clone());
                state.operations.remove(&id);
                detached += 1;
            } else if matches!(status, OperationStatus::Pending | OperationStatus::Retrying) {
                state.operations.remove(&id);
                cancelled += 1;
            }
        }

        if !state.outstanding_for(entity_id) {
            self.inner
                .store
                .dispatch(Action::RemovePendingSync(vec![entity_id.clone()]));
        }
        if cancelled + detached > 0 {
            info!(cancelled, detached, "entity operations cancelled");
        }
        cancelled
    }

    /// Drops every record. Running operations are detached: they finish,
    /// their actions are dispatched, their follow-ups are dropped.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> usize {
        let mut state = self.inner.state.write().await;
        let records: Vec<SyncOperation> = state.operations.drain().map(|(_, o)| o).collect();

        let mut released = HashSet::new();
        for op in &records {
            if state.active.contains(&op.id) {
                state.detached.insert(op.id.clone(), op.entity_id.clone());
            } else {
                released.insert(op.entity_id.clone());
            }
        }
        let released: Vec<EntityId> = released
            .into_iter()
            .filter(|e| !state.outstanding_for(e))
            .collect();
        if !released.is_empty() {
            self.inner
                .store
                .dispatch(Action::RemovePendingSync(released));
        }
        info!(
            removed = records.len(),
            detached = state.detached.len(),
            "sync queue cleared"
        );
        records.len()
    }

    /// Re-arms a permanently failed operation with a fresh attempt budget.
    #[instrument(skip(self, id), fields(op_id = %id))]
    pub async fn retry(&self, id: &OperationId) -> Result<(), QueueError> {
        let snapshot = {
            let mut state = self.inner.state.write().await;
            let record = state
                .operations
                .get_mut(id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            if record.status != OperationStatus::Failed {
                return Err(QueueError::InvalidState {
                    id: id.to_string(),
                    status: record.status,
                    expected: "failed",
                });
            }
            record.attempts = 0;
            record.status = OperationStatus::Pending;
            record.last_error = None;
            record.updated_at = UnixTimeMs::now();
            let snapshot = record.snapshot();

            self.inner
                .store
                .dispatch(Action::AddPendingSync(vec![snapshot.entity_id.clone()]));
            for action in snapshot.kind.rearm_actions(&snapshot.entity_id) {
                self.inner.store.dispatch(action);
            }
            snapshot
        };

        info!("operation re-armed");
        self.inner
            .events
            .publish(SyncEvent::OperationUpdated(snapshot));
        self.inner.changed.notify_one();
        Ok(())
    }

    pub async fn get(&self, id: &OperationId) -> Option<OperationSnapshot> {
        let state = self.inner.state.read().await;
        state.operations.get(id).map(SyncOperation::snapshot)
    }

    /// All records, oldest first.
    pub async fn snapshot(&self) -> Vec<OperationSnapshot> {
        let state = self.inner.state.read().await;
        let mut snapshots: Vec<_> = state
            .operations
            .values()
            .map(SyncOperation::snapshot)
            .collect();
        snapshots.sort_by_key(|s| s.seq);
        snapshots
    }

    pub async fn operations_for(&self, entity_id: &EntityId) -> Vec<OperationSnapshot> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|s| &s.entity_id == entity_id)
            .collect()
    }

    pub async fn depth(&self) -> QueueDepth {
        let state = self.inner.state.read().await;
        let mut depth = QueueDepth {
            total: state.operations.len(),
            active: state.active.len(),
            ..QueueDepth::default()
        };
        for op in state.operations.values() {
            match op.status {
                OperationStatus::Pending => depth.pending += 1,
                OperationStatus::Processing => depth.processing += 1,
                OperationStatus::Retrying => depth.retrying += 1,
                OperationStatus::Completed => depth.completed += 1,
                OperationStatus::Failed => depth.failed += 1,
            }
            *depth.by_kind.entry(op.kind).or_insert(0) += 1;
        }
        depth
    }

    /// No queued, retrying or running work.
    pub async fn is_idle(&self) -> bool {
        let state = self.inner.state.read().await;
        state.active.is_empty() && state.live_count() == 0
    }

    /// Ticks until every outstanding operation reached a terminal state,
    /// including retries waiting out their backoff.
    pub async fn drain(&self) {
        loop {
            self.tick().await;
            if self.is_idle().await {
                return;
            }
            tokio::select! {
                _ = self.inner.changed.notified() => {}
                _ = tokio::time::sleep(self.tick_interval()) => {}
            }
        }
    }

    /// Spawns the fixed-interval worker. Idempotent.
    pub async fn start(&self) {
        let mut worker = self.inner.worker.lock().await;
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.inner.shutdown.send_replace(false);

        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        let period = self.tick_interval();

        *worker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        SyncQueue { inner }.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("sync worker stopped");
        }));
        info!(tick_ms = period.as_millis() as u64, "sync worker started");
    }

    /// Stops the worker. Operations already running finish on their own.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("sync worker ended abnormally: {}", e);
            }
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }
}
