use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    EngineError, Result,
    aggregate::AggregateSnapshot,
    store::{Commit, DocFilter, DocumentStore, Documents, EventStreamEntry, MultiModelStore},
};

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Vec<EventStreamEntry>>,
    collections: HashMap<String, BTreeMap<String, Value>>,
}

impl Inner {
    fn aggregate_version(&self, stream: &str, aggregate_key: &str) -> u64 {
        self.streams
            .get(stream)
            .and_then(|entries| {
                entries
                    .iter()
                    .rev()
                    .find(|entry| entry.aggregate_key == aggregate_key)
            })
            .map(|entry| entry.aggregate_version)
            .unwrap_or(0)
    }
}

/// Multi-model store kept in process memory.
///
/// Streams and document collections sit behind one lock, so a commit (version check, append and
/// snapshot) is atomic. Snapshots are plain documents of their collection and can be queried with
/// [`DocumentStore::find_docs`]. Clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MultiModelStore for InMemoryStore {
    async fn commit(&self, commit: Commit) -> Result<u64> {
        let mut inner = self.inner.write().await;

        let current = inner.aggregate_version(&commit.stream, &commit.aggregate_key);
        if current != commit.expected_version {
            return Err(EngineError::ConcurrencyConflict {
                stream: commit.stream,
                aggregate: commit.aggregate_key,
                expected: commit.expected_version,
                actual: current,
            });
        }

        let entries = inner.streams.entry(commit.stream.clone()).or_default();
        let mut sequence_no = entries.last().map(|entry| entry.sequence_no).unwrap_or(0);
        let mut version = current;
        for event in commit.events {
            sequence_no += 1;
            version += 1;
            entries.push(EventStreamEntry {
                stream: commit.stream.clone(),
                sequence_no,
                aggregate_key: commit.aggregate_key.clone(),
                aggregate_version: version,
                event,
            });
        }

        if let Some(write) = commit.snapshot {
            inner
                .collections
                .entry(write.collection)
                .or_default()
                .insert(write.snapshot.aggregate_id.clone(), write.snapshot.to_document());
        }

        Ok(version)
    }

    async fn get_snapshot(
        &self,
        collection: &str,
        aggregate_id: &str,
    ) -> Result<Option<AggregateSnapshot>> {
        let inner = self.inner.read().await;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(aggregate_id))
            .and_then(AggregateSnapshot::from_document))
    }

    async fn aggregate_version(&self, stream: &str, aggregate_key: &str) -> Result<u64> {
        Ok(self.inner.read().await.aggregate_version(stream, aggregate_key))
    }

    async fn read_aggregate(
        &self,
        stream: &str,
        aggregate_key: &str,
        after_version: u64,
    ) -> Result<Vec<EventStreamEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .streams
            .get(stream)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| {
                        entry.aggregate_key == aggregate_key
                            && entry.aggregate_version > after_version
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_stream(
        &self,
        stream: &str,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<EventStreamEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .streams
            .get(stream)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.sequence_no >= from_sequence)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn has_collection(&self, collection: &str) -> Result<bool> {
        Ok(self.inner.read().await.collections.contains_key(collection))
    }

    async fn add_collection(&self, collection: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .collections
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn get_doc(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let inner = self.inner.read().await;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn find_docs(&self, collection: &str, filter: &DocFilter) -> Result<Documents> {
        let inner = self.inner.read().await;
        let docs: Vec<Value> = inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::new(docs.into_iter()))
    }

    async fn add_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let mut inner = self.inner.write().await;
        let docs = inner.collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(EngineError::storage(anyhow!(
                "document `{id}` already exists in `{collection}`"
            )));
        }
        docs.insert(id.to_string(), doc);
        Ok(())
    }

    async fn upsert_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        self.inner
            .write()
            .await
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn delete_doc(&self, collection: &str, id: &str) -> Result<()> {
        if let Some(docs) = self.inner.write().await.collections.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.inner.write().await.collections.remove(collection);
        Ok(())
    }
}
