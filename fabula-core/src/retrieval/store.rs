//! In-memory vector store.
//!
//! One record per indexed text (a turn, a summary, or a discovered entity),
//! keyed by the world it belongs to. The store is shared between the
//! background indexer (writer) and the retriever (reader) behind an async
//! read/write lock.

use crate::dispatch::IndexSourceKind;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// The store as it is actually passed around.
pub type SharedVectorStore = Arc<RwLock<VectorStore>>;

/// One embedded text.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: Uuid,
    pub world_id: Uuid,
    pub kind: IndexSourceKind,
    /// Position in the owning log (turn index, summary index) or 0 for
    /// entities.
    pub source_index: usize,
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Default)]
pub struct VectorStore {
    records: Vec<VectorRecord>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedVectorStore {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Insert a record, replacing any earlier record for the same source.
    /// Re-indexing the same turn or entity must not duplicate it.
    pub fn upsert(&mut self, record: VectorRecord) {
        self.records.retain(|r| {
            !(r.world_id == record.world_id
                && r.kind == record.kind
                && r.source_index == record.source_index
                && r.text == record.text)
        });
        self.records.push(record);
    }

    pub fn records_for(&self, world_id: Uuid, kind: IndexSourceKind) -> Vec<&VectorRecord> {
        self.records
            .iter()
            .filter(|r| r.world_id == world_id && r.kind == kind)
            .collect()
    }

    /// Drop every record belonging to a world. Used when a save is pruned.
    pub fn remove_world(&mut self, world_id: Uuid) {
        self.records.retain(|r| r.world_id != world_id);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
