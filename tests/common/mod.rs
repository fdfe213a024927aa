#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::{ExtendedColorType, ImageEncoder};
use uxlens_core::capabilities::memory::{MemoryAnalysis, MemoryBlobStorage, MemoryPersistence};
use uxlens_core::capabilities::{BlobStorage, CapabilityError, StoredBlob};
use uxlens_core::{Collaborators, EngineConfig, SyncService, UploadFile};

pub fn create_test_png(width: u32, height: u32) -> Vec<u8> {
    let pixels = vec![200u8; (width * height * 4) as usize];
    let mut buffer = Vec::new();
    image::codecs::png::PngEncoder::new(&mut buffer)
        .write_image(&pixels, width, height, ExtendedColorType::Rgba8)
        .unwrap();
    buffer
}

pub fn png_file(name: &str) -> UploadFile {
    UploadFile::new(name, create_test_png(16, 9))
}

/// Blob storage that fails or stalls on demand and counts every call.
#[derive(Default)]
pub struct FailableStorage {
    pub inner: MemoryBlobStorage,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    pub delay: Option<Duration>,
}

impl FailableStorage {
    pub fn failing() -> Self {
        let storage = Self::default();
        storage.fail.store(true, Ordering::SeqCst);
        storage
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStorage for FailableStorage {
    async fn upload(
        &self,
        bytes: Bytes,
        path: &str,
        content_type: &str,
    ) -> Result<StoredBlob, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CapabilityError::Network("connection reset".into()));
        }
        self.inner.upload(bytes, path, content_type).await
    }
}

/// A session over in-memory collaborators, with handles kept for assertions.
pub struct Harness {
    pub service: SyncService,
    pub storage: Arc<FailableStorage>,
    pub analysis: Arc<MemoryAnalysis>,
    pub persistence: Arc<MemoryPersistence>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FailableStorage::default(), MemoryPersistence::new())
    }

    pub fn with(storage: FailableStorage, persistence: MemoryPersistence) -> Self {
        let storage = Arc::new(storage);
        let analysis = Arc::new(MemoryAnalysis::new());
        let persistence = Arc::new(persistence);
        let collaborators = Collaborators {
            storage: storage.clone(),
            analysis: analysis.clone(),
            persistence: persistence.clone(),
        };
        let service = SyncService::new(EngineConfig::default(), collaborators).unwrap();
        Self {
            service,
            storage,
            analysis,
            persistence,
        }
    }
}
