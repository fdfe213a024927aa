//! In-process collaborators for offline mode and tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    AnalysisApi, AnalysisRequest, AnalysisResult, BlobStorage, CapabilityError, PersistenceApi,
    StoredBlob,
};
use crate::mapping::{AnalysisRecord, DatabaseSnapshot, ImageRecord};
use crate::model::{AnalysisId, Suggestion};

/// Database kept in memory. Records created without an id get a
/// sequential canonical id and keep their `client_ref`.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    db: RwLock<DatabaseSnapshot>,
    next_id: AtomicU64,
    migrations: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: DatabaseSnapshot) -> Self {
        Self {
            db: RwLock::new(snapshot),
            ..Self::default()
        }
    }

    pub async fn snapshot(&self) -> DatabaseSnapshot {
        self.db.read().await.clone()
    }

    pub async fn replace(&self, snapshot: DatabaseSnapshot) {
        *self.db.write().await = snapshot;
    }

    pub fn migration_count(&self) -> usize {
        self.migrations.load(Ordering::Relaxed)
    }

    fn mint(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}-{n}")
    }

    fn upsert_image(&self, db: &mut DatabaseSnapshot, mut record: ImageRecord) {
        let existing = match (&record.id, &record.client_ref) {
            (Some(id), _) => db.images.iter().position(|r| r.id.as_ref() == Some(id)),
            (None, Some(client_ref)) => db
                .images
                .iter()
                .position(|r| r.client_ref.as_ref() == Some(client_ref)),
            (None, None) => None,
        };
        match existing {
            Some(index) => {
                record.id = db.images[index].id.clone();
                if record.client_ref.is_none() {
                    record.client_ref = db.images[index].client_ref.clone();
                }
                db.images[index] = record;
            }
            None => {
                if record.id.is_none() {
                    record.id = Some(self.mint("img"));
                }
                db.images.push(record);
            }
        }
    }

    fn upsert_analysis(&self, db: &mut DatabaseSnapshot, mut record: AnalysisRecord) {
        // Temporary image references resolve through the image's client_ref.
        if let Some(image_ref) = record.image_id.clone() {
            if let Some(image) = db
                .images
                .iter()
                .find(|r| r.client_ref.as_ref() == Some(&image_ref))
            {
                record.image_id = image.id.clone();
            }
        }

        let existing = match &record.id {
            Some(id) => db.analyses.iter().position(|r| r.id.as_ref() == Some(id)),
            None => db
                .analyses
                .iter()
                .position(|r| r.image_id.is_some() && r.image_id == record.image_id),
        };
        match existing {
            Some(index) => {
                record.id = db.analyses[index].id.clone();
                db.analyses[index] = record;
            }
            None => {
                if record.id.is_none() {
                    record.id = Some(self.mint("an"));
                }
                db.analyses.push(record);
            }
        }
    }
}

#[async_trait]
impl PersistenceApi for MemoryPersistence {
    async fn load_all(&self) -> Result<DatabaseSnapshot, CapabilityError> {
        Ok(self.db.read().await.clone())
    }

    async fn migrate_all(&self, records: &DatabaseSnapshot) -> Result<(), CapabilityError> {
        let mut db = self.db.write().await;
        for image in &records.images {
            self.upsert_image(&mut db, image.clone());
        }
        for analysis in &records.analyses {
            self.upsert_analysis(&mut db, analysis.clone());
        }
        upsert_by_id(&mut db.groups, &records.groups, |r| r.id.clone());
        upsert_by_id(&mut db.group_analyses, &records.group_analyses, |r| r.id.clone());
        upsert_by_id(&mut db.concepts, &records.concepts, |r| r.id.clone());

        self.migrations.fetch_add(1, Ordering::Relaxed);
        debug!(images = db.images.len(), analyses = db.analyses.len(), "migrated records");
        Ok(())
    }
}

fn upsert_by_id<T: Clone>(target: &mut Vec<T>, incoming: &[T], id: impl Fn(&T) -> Option<String>) {
    for record in incoming {
        let Some(key) = id(record) else { continue };
        match target.iter().position(|r| id(r).as_deref() == Some(key.as_str())) {
            Some(index) => target[index] = record.clone(),
            None => target.push(record.clone()),
        }
    }
}

/// Deterministic stand-in for the analysis service.
#[derive(Debug, Default)]
pub struct MemoryAnalysis {
    calls: AtomicUsize,
}

impl MemoryAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AnalysisApi for MemoryAnalysis {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, CapabilityError> {
        if request.image_url.trim().is_empty() {
            return Err(CapabilityError::InvalidRequest("image url is empty".into()));
        }
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let context = request.context.as_deref().unwrap_or("general");
        Ok(AnalysisResult {
            analysis_id: Some(AnalysisId::new(format!("analysis-{n}"))),
            summary: format!("Heuristic review of {} ({context})", request.image_id),
            annotations: Vec::new(),
            suggestions: vec![Suggestion {
                id: format!("suggestion-{n}"),
                category: "accessibility".into(),
                title: "Increase contrast".into(),
                description: "Body text falls below a 4.5:1 contrast ratio.".into(),
                priority: 2,
            }],
        })
    }
}

/// Blob storage that keeps objects in a map and serves them under `base`.
#[derive(Debug)]
pub struct MemoryBlobStorage {
    base: String,
    objects: RwLock<HashMap<String, (Bytes, String)>>,
}

impl MemoryBlobStorage {
    pub const DEFAULT_BASE: &'static str = "memory://blobs/";

    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn get(&self, path: &str) -> Option<Bytes> {
        self.objects.read().await.get(path).map(|(b, _)| b.clone())
    }
}

impl Default for MemoryBlobStorage {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE)
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn upload(
        &self,
        bytes: Bytes,
        path: &str,
        content_type: &str,
    ) -> Result<StoredBlob, CapabilityError> {
        let path = path.trim_start_matches('/');
        if path.is_empty() || path.contains("..") {
            return Err(CapabilityError::InvalidRequest(format!("invalid blob path {path:?}")));
        }
        let url = url::Url::parse(&self.base)
            .and_then(|base| base.join(path))
            .map_err(|e| CapabilityError::InvalidRequest(e.to_string()))?;

        self.objects
            .write()
            .await
            .insert(path.to_string(), (bytes, content_type.to_string()));

        Ok(StoredBlob {
            url,
            path: path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImageId;

    #[tokio::test]
    async fn migrate_assigns_ids_and_resolves_client_refs() {
        let db = MemoryPersistence::new();
        let records = DatabaseSnapshot {
            images: vec![ImageRecord {
                client_ref: Some("temp-a".into()),
                status: Some("analyzing".into()),
                ..ImageRecord::default()
            }],
            analyses: vec![AnalysisRecord {
                image_id: Some("temp-a".into()),
                status: Some("processing".into()),
                ..AnalysisRecord::default()
            }],
            ..DatabaseSnapshot::default()
        };

        db.migrate_all(&records).await.unwrap();
        db.migrate_all(&records).await.unwrap();

        let stored = db.load_all().await.unwrap();
        assert_eq!(stored.images.len(), 1);
        assert_eq!(stored.analyses.len(), 1);
        assert_eq!(stored.images[0].id.as_deref(), Some("img-1"));
        assert_eq!(stored.analyses[0].image_id.as_deref(), Some("img-1"));
        assert_eq!(db.migration_count(), 2);
    }

    #[tokio::test]
    async fn blob_upload_returns_joined_url() {
        let storage = MemoryBlobStorage::default();
        let blob = storage
            .upload(Bytes::from_static(b"png"), "uploads/temp-1.png", "image/png")
            .await
            .unwrap();
        assert_eq!(blob.url.as_str(), "memory://blobs/uploads/temp-1.png");
        assert_eq!(storage.object_count().await, 1);

        assert!(storage
            .upload(Bytes::new(), "../etc/passwd", "text/plain")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn analysis_is_deterministic_per_call() {
        let api = MemoryAnalysis::new();
        let request = AnalysisRequest {
            image_id: ImageId::new("img-1"),
            image_url: "memory://blobs/a.png".into(),
            context: None,
        };
        let result = api.analyze(&request).await.unwrap();
        assert_eq!(result.analysis_id, Some(AnalysisId::new("analysis-1")));
        assert_eq!(api.call_count(), 1);
    }
}
