//! Background embedding indexer.
//!
//! The session thread hands index requests to a detached worker task and
//! moves on; embeddings are computed off the critical path. A failed
//! embedding is logged and dropped, never retried and never surfaced to the
//! player.

use super::store::{SharedVectorStore, VectorRecord};
use crate::dispatch::IndexRequest;
use gemini::Gemini;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// A batch of index requests for one world.
#[derive(Debug)]
pub struct IndexJob {
    pub world_id: Uuid,
    pub requests: Vec<IndexRequest>,
}

/// Handle to the background indexing worker.
#[derive(Clone)]
pub struct EmbeddingIndexer {
    sender: mpsc::UnboundedSender<IndexJob>,
}

impl EmbeddingIndexer {
    /// Spawn the worker and return its handle. The worker runs until every
    /// handle is dropped.
    pub fn spawn(client: Gemini, store: SharedVectorStore) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(client, store, receiver));
        Self { sender }
    }

    /// Enqueue a batch without blocking. Requests submitted after the worker
    /// has stopped are dropped with a warning.
    pub fn submit(&self, world_id: Uuid, requests: Vec<IndexRequest>) {
        if requests.is_empty() {
            return;
        }
        let count = requests.len();
        if self
            .sender
            .send(IndexJob { world_id, requests })
            .is_err()
        {
            warn!("index worker stopped; dropping {count} requests");
        }
    }
}

async fn run_worker(
    client: Gemini,
    store: SharedVectorStore,
    mut receiver: mpsc::UnboundedReceiver<IndexJob>,
) {
    while let Some(job) = receiver.recv().await {
        for request in job.requests {
            let embedding = match client.embed(&request.text).await {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!("embedding failed; dropping index request: {e}");
                    continue;
                }
            };
            let record = VectorRecord {
                id: Uuid::new_v4(),
                world_id: job.world_id,
                kind: request.kind,
                source_index: request.source_index,
                text: request.text,
                embedding,
            };
            store.write().await.upsert(record);
        }
    }
}
