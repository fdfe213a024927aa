use std::io::Cursor;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use image::{ImageError, ImageReader, Limits};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument, warn};

use crate::config::{require_nonzero, ConfigError};
use crate::error::{AppError, ErrorKind};
use crate::model::Dimensions;

#[derive(Debug, Error)]
pub enum ImageProcessingError {
    #[error("failed to decode image: {source}")]
    Decode {
        #[from]
        source: ImageError,
    },

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("probe task aborted")]
    Aborted,

    #[error("service overloaded, try again later")]
    Overloaded,
}

impl From<ImageProcessingError> for AppError {
    fn from(err: ImageProcessingError) -> Self {
        let kind = match &err {
            ImageProcessingError::Decode { .. } | ImageProcessingError::EmptyInput => {
                ErrorKind::ImageProcessing
            }
            ImageProcessingError::ImageTooLarge { .. } => ErrorKind::ImageDimensionsTooLarge,
            ImageProcessingError::InputTooLarge { .. } => ErrorKind::ImageTooLarge,
            ImageProcessingError::UnsupportedFormat => ErrorKind::ImageFormatUnsupported,
            ImageProcessingError::Aborted => ErrorKind::Internal,
            ImageProcessingError::Overloaded => ErrorKind::RateLimited,
        };
        AppError::new(kind, err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_image_pixels: u64,
    pub max_input_bytes: usize,
    pub max_alloc_bytes: u64,
    pub max_dimension: u32,
    pub max_concurrent_ops: usize,
    /// Entries in the content-hash to dimensions cache.
    pub cache_capacity: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_image_pixels: 100_000_000,
            max_input_bytes: crate::MAX_UPLOAD_BYTES,
            max_alloc_bytes: 512 * 1024 * 1024,
            max_dimension: 15_000,
            max_concurrent_ops: 4,
            cache_capacity: 256,
        }
    }
}

impl ProcessingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero(self.max_image_pixels, "processing.max_image_pixels")?;
        require_nonzero(self.max_input_bytes as u64, "processing.max_input_bytes")?;
        require_nonzero(u64::from(self.max_dimension), "processing.max_dimension")?;
        require_nonzero(self.max_concurrent_ops as u64, "processing.max_concurrent_ops")?;
        require_nonzero(self.cache_capacity as u64, "processing.cache_capacity")?;
        Ok(())
    }
}

/// Result of probing an image header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbedImage {
    pub dimensions: Dimensions,
    pub content_type: &'static str,
    /// Hex blake3 of the raw bytes.
    pub content_hash: String,
}

/// Reads intrinsic dimensions off the async executor. Concurrent probes are
/// bounded by a semaphore and results are memoized by content hash.
pub struct ImageProcessor {
    config: ProcessingConfig,
    semaphore: Arc<Semaphore>,
    cache: Mutex<LruCache<String, (Dimensions, &'static str)>>,
}

impl ImageProcessor {
    pub fn new(config: ProcessingConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_ops.max(1)));
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            semaphore,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ProcessingConfig::default())
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    #[instrument(skip(self, raw_bytes), fields(input_size = raw_bytes.len()))]
    pub async fn probe(&self, raw_bytes: Bytes) -> Result<ProbedImage, ImageProcessingError> {
        let content_hash = content_hash(&raw_bytes);

        if let Some(&(dimensions, content_type)) = self.cache.lock().await.get(&content_hash) {
            debug!("dimension cache hit");
            return Ok(ProbedImage {
                dimensions,
                content_type,
                content_hash,
            });
        }

        let start = Instant::now();
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ImageProcessingError::Overloaded)?;

        let config = self.config.clone();
        let result = tokio::task::spawn_blocking(move || probe_sync(&config, &raw_bytes))
            .await
            .map_err(|_| ImageProcessingError::Aborted)?;

        match result {
            Ok((dimensions, content_type)) => {
                self.cache
                    .lock()
                    .await
                    .put(content_hash.clone(), (dimensions, content_type));
                debug!(
                    width = dimensions.width,
                    height = dimensions.height,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "probed image"
                );
                Ok(ProbedImage {
                    dimensions,
                    content_type,
                    content_hash,
                })
            }
            Err(e) => {
                warn!("probe failed: {}", e);
                Err(e)
            }
        }
    }
}

/// Hex blake3 digest used as the content hash of uploads.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Header-only read of the dimensions. The decoder limits reject oversized
/// images before any pixel buffer is allocated.
fn probe_sync(
    config: &ProcessingConfig,
    raw_bytes: &[u8],
) -> Result<(Dimensions, &'static str), ImageProcessingError> {
    if raw_bytes.is_empty() {
        return Err(ImageProcessingError::EmptyInput);
    }

    if raw_bytes.len() > config.max_input_bytes {
        return Err(ImageProcessingError::InputTooLarge {
            size: raw_bytes.len(),
            max_size: config.max_input_bytes,
        });
    }

    let mut reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(|e| ImageProcessingError::Decode { source: e.into() })?;

    let Some(format) = reader.format() else {
        return Err(ImageProcessingError::UnsupportedFormat);
    };

    let mut limits = Limits::default();
    limits.max_image_width = Some(config.max_dimension);
    limits.max_image_height = Some(config.max_dimension);
    limits.max_alloc = Some(config.max_alloc_bytes);
    reader.limits(limits);

    let (width, height) = reader.into_dimensions().map_err(|e| match e {
        ImageError::Unsupported(_) => ImageProcessingError::UnsupportedFormat,
        other => ImageProcessingError::Decode { source: other },
    })?;

    let pixels = u64::from(width) * u64::from(height);
    if pixels > config.max_image_pixels {
        return Err(ImageProcessingError::ImageTooLarge {
            width,
            height,
            pixels,
            max_pixels: config.max_image_pixels,
        });
    }

    Ok((Dimensions::new(width, height), format.to_mime_type()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ExtendedColorType, ImageEncoder};
    use proptest::prelude::*;

    fn create_test_png(width: u32, height: u32) -> Vec<u8> {
        use image::{ImageBuffer, Rgba};
        let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
        });
        let mut buffer = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buffer);
        encoder
            .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
            .unwrap();
        buffer
    }

    #[test]
    fn probe_rejects_empty() {
        let config = ProcessingConfig::default();
        assert!(matches!(
            probe_sync(&config, &[]),
            Err(ImageProcessingError::EmptyInput)
        ));
    }

    #[test]
    fn probe_rejects_garbage() {
        let config = ProcessingConfig::default();
        assert!(probe_sync(&config, &[0xFF, 0xFE, 0x00]).is_err());
    }

    #[test]
    fn probe_rejects_oversized_input() {
        let config = ProcessingConfig {
            max_input_bytes: 100,
            ..Default::default()
        };
        let data = vec![0u8; 101];
        let result = probe_sync(&config, &data);
        assert!(matches!(result, Err(ImageProcessingError::InputTooLarge { .. })));
    }

    #[test]
    fn probe_reads_png_header() {
        let config = ProcessingConfig::default();
        let png = create_test_png(120, 80);
        let (dimensions, content_type) = probe_sync(&config, &png).unwrap();
        assert_eq!(dimensions, Dimensions::new(120, 80));
        assert_eq!(content_type, "image/png");
    }

    #[test]
    fn probe_enforces_pixel_budget() {
        let config = ProcessingConfig {
            max_image_pixels: 100,
            ..Default::default()
        };
        let png = create_test_png(20, 20);
        assert!(matches!(
            probe_sync(&config, &png),
            Err(ImageProcessingError::ImageTooLarge { pixels: 400, .. })
        ));
    }

    #[tokio::test]
    async fn repeated_probe_hits_cache() {
        let processor = ImageProcessor::with_defaults();
        let png = Bytes::from(create_test_png(32, 16));

        let first = processor.probe(png.clone()).await.unwrap();
        let second = processor.probe(png).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(processor.cache.lock().await.len(), 1);
    }

    #[test]
    fn processing_errors_map_to_app_kinds() {
        let err: AppError = ImageProcessingError::UnsupportedFormat.into();
        assert_eq!(err.kind, ErrorKind::ImageFormatUnsupported);
        assert!(!err.is_retryable());
    }

    proptest! {
        #[test]
        fn probe_never_panics_on_arbitrary_bytes(
            data in proptest::collection::vec(any::<u8>(), 0..256)
        ) {
            let config = ProcessingConfig::default();
            let _ = probe_sync(&config, &data);
        }
    }
}
