use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::ConflictPolicy;
use crate::error::{RagError, RagResult};
use crate::types::DocumentId;

type LockMap = DashMap<DocumentId, Arc<Mutex<()>>>;

/// Serializes work on the same document id.
#[derive(Debug, Default, Clone)]
pub struct DocumentLocks {
    locks: Arc<LockMap>,
}

/// Held while a document is being ingested or deleted.
#[derive(Debug)]
pub struct DocumentGuard {
    id: DocumentId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl Drop for DocumentGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map still references an idle lock
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Wait` queues behind the current holder; `Fail` returns
    /// `IngestionInProgress` immediately.
    pub async fn acquire(
        &self,
        id: &DocumentId,
        policy: ConflictPolicy,
    ) -> RagResult<DocumentGuard> {
        let lock = self.locks.entry(id.clone()).or_default().clone();
        let guard = match policy {
            ConflictPolicy::Wait => lock.lock_owned().await,
            ConflictPolicy::Fail => lock
                .try_lock_owned()
                .map_err(|_| RagError::IngestionInProgress(id.to_string()))?,
        };
        Ok(DocumentGuard {
            id: id.clone(),
            guard: Some(guard),
            locks: self.locks.clone(),
        })
    }

    pub fn is_locked(&self, id: &DocumentId) -> bool {
        self.locks
            .get(id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}
