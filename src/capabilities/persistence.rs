use async_trait::async_trait;

use super::CapabilityError;
use crate::mapping::DatabaseSnapshot;

/// Remote database holding the authoritative records.
#[async_trait]
pub trait PersistenceApi: Send + Sync {
    /// Every record visible to the current user.
    async fn load_all(&self) -> Result<DatabaseSnapshot, CapabilityError>;

    /// Upserts the given records. Records without an id are created and
    /// keep their `client_ref`.
    async fn migrate_all(&self, records: &DatabaseSnapshot) -> Result<(), CapabilityError>;
}
