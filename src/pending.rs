use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::model::EntityId;

/// Entity ids with queued, retrying or running sync work.
///
/// Merges from the remote snapshot are gated on this set being empty, so it
/// must track the sync queue exactly: the queue adds an id before the first
/// operation for it becomes visible and removes it only after the last one
/// reaches a terminal state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingSync(BTreeSet<EntityId>);

impl PendingSync {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the id was not already tracked.
    pub fn insert(&mut self, id: EntityId) -> bool {
        self.0.insert(id)
    }

    /// Returns true if the id was tracked.
    pub fn remove(&mut self, id: &EntityId) -> bool {
        self.0.remove(id)
    }

    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.0.contains(id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityId> {
        self.0.iter()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl FromIterator<EntityId> for PendingSync {
    fn from_iter<T: IntoIterator<Item = EntityId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Monotonic change counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn bump(&mut self) {
        self.0 = self.0.saturating_add(1);
    }
}
