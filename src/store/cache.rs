use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::CollectionInfo;
use crate::types::CollectionId;

/// Short-lived cache of collection dimension and existence.
///
/// Entries expire after `ttl`. Callers invalidate on `DimensionalityConflict`
/// so a stale entry never turns into a false rejection.
#[derive(Debug)]
pub struct MetadataCache {
    entries: DashMap<CollectionId, (CollectionInfo, Instant)>,
    ttl: Duration,
}

impl MetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, collection: &CollectionId) -> Option<CollectionInfo> {
        let entry = self.entries.get(collection)?;
        let (info, stored_at) = entry.value();
        if stored_at.elapsed() < self.ttl {
            return Some(info.clone());
        }
        drop(entry);
        self.entries.remove(collection);
        None
    }

    pub fn insert(&self, info: CollectionInfo) {
        self.entries
            .insert(info.collection.clone(), (info, Instant::now()));
    }

    pub fn invalidate(&self, collection: &CollectionId) {
        if self.entries.remove(collection).is_some() {
            tracing::debug!(target: "store", "invalidated cached metadata for '{collection}'");
        }
    }
}
