use async_trait::async_trait;
use bytes::Bytes;

use super::CapabilityError;

/// Location of an uploaded blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlob {
    pub url: url::Url,
    pub path: String,
}

/// Binary object storage for image files.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn upload(
        &self,
        bytes: Bytes,
        path: &str,
        content_type: &str,
    ) -> Result<StoredBlob, CapabilityError>;
}
