use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use crate::error::{ErrorKind, RagResult};
use crate::types::{CollectionId, DocumentId, DocumentRecord, DocumentStatus, FailureDetail};

/// In-process record of every document and the collection that owns it.
#[derive(Debug, Default)]
pub struct DocumentRegistry {
    records: DashMap<DocumentId, DocumentRecord>,
    members: DashMap<CollectionId, BTreeSet<DocumentId>>,
    /// One writer at a time; the snapshot is taken under it.
    save_lock: Mutex<()>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record. A new ingestion request is the only way a
    /// `failed` record is replaced.
    pub fn put(&self, record: DocumentRecord) {
        self.members
            .entry(record.collection.clone())
            .or_default()
            .insert(record.id.clone());
        self.records.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &DocumentId) -> Option<DocumentRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Apply `change` and bump `updated_at`. Returns the new record, or
    /// `None` when the document was removed meanwhile.
    pub fn update(
        &self,
        id: &DocumentId,
        change: impl FnOnce(&mut DocumentRecord),
    ) -> Option<DocumentRecord> {
        let mut record = self.records.get_mut(id)?;
        change(&mut record);
        record.updated_at = Utc::now();
        Some(record.clone())
    }

    pub fn remove(&self, id: &DocumentId) -> Option<DocumentRecord> {
        let (_, record) = self.records.remove(id)?;
        if let Some(mut members) = self.members.get_mut(&record.collection) {
            members.remove(id);
        }
        Some(record)
    }

    /// Document ids owned by `collection`, in id order.
    pub fn members(&self, collection: &CollectionId) -> Vec<DocumentId> {
        self.members
            .get(collection)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records of `collection`, oldest first.
    pub fn list(&self, collection: &CollectionId) -> Vec<DocumentRecord> {
        let mut records: Vec<DocumentRecord> = self
            .members(collection)
            .iter()
            .filter_map(|id| self.get(id))
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Every record, ordered by collection then id.
    pub fn snapshot(&self) -> Vec<DocumentRecord> {
        let mut records: Vec<DocumentRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.collection.cmp(&b.collection).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Write all records as JSON, replacing the file atomically.
    ///
    /// Concurrent saves are serialized, so the file always ends up holding
    /// the latest snapshot.
    #[must_use = "Save errors should be handled to ensure records are persisted"]
    pub fn save(&self, path: &Path) -> RagResult<()> {
        let _writer = self.save_lock.lock();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Read records saved by [`save`](Self::save). A missing file is an
    /// empty registry.
    ///
    /// Records interrupted mid-ingestion come back `failed`; they only
    /// recover through a new ingestion request.
    pub fn load(path: &Path) -> RagResult<Self> {
        let registry = Self::new();
        if !path.exists() {
            return Ok(registry);
        }
        let records: Vec<DocumentRecord> = serde_json::from_slice(&std::fs::read(path)?)?;
        for mut record in records {
            if !record.status.is_terminal() {
                record.status = DocumentStatus::Failed;
                record.error = Some(FailureDetail {
                    kind: ErrorKind::Cancelled,
                    message: "process exited during ingestion".to_string(),
                });
            }
            registry.put(record);
        }
        Ok(registry)
    }

    /// Forget the collection and all its records.
    pub fn remove_collection(&self, collection: &CollectionId) -> Vec<DocumentId> {
        let Some((_, ids)) = self.members.remove(collection) else {
            return Vec::new();
        };
        for id in &ids {
            self.records.remove(id);
        }
        ids.into_iter().collect()
    }
}
