use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Message, Result, aggregate::AggregateSnapshot};

pub mod document;
pub mod memory;

pub use document::{DocFilter, DocumentStore, Documents};
pub use memory::InMemoryStore;

/// One committed event, positioned in its stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventStreamEntry {
    pub stream: String,
    /// Position in the stream, starting at 1 and strictly increasing.
    pub sequence_no: u64,
    /// `"{aggregate_type}-{aggregate_id}"` of the aggregate that recorded the event.
    pub aggregate_key: String,
    /// Version of the aggregate once this event is applied.
    pub aggregate_version: u64,
    pub event: Message,
}

/// Snapshot to store in `collection` as part of a commit.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotWrite {
    pub collection: String,
    pub snapshot: AggregateSnapshot,
}

/// Events of one aggregate and its optional snapshot, written as a single unit.
#[derive(Clone, Debug, PartialEq)]
pub struct Commit {
    pub stream: String,
    pub aggregate_key: String,
    /// Version the aggregate had when it was loaded; the commit fails if it moved since.
    pub expected_version: u64,
    pub events: Vec<Message>,
    pub snapshot: Option<SnapshotWrite>,
}

/// The `MultiModelStore` trait is the write model storage: append-only event streams plus
/// aggregate snapshots.
///
/// Implementations must apply a [`Commit`] atomically: either all its events are appended and the
/// snapshot is stored, or nothing is. A commit whose `expected_version` does not match the current
/// version of the aggregate fails with [`EngineError::ConcurrencyConflict`](crate::EngineError)
/// without writing anything. Backend failures are reported as `StorageUnavailable`.
#[async_trait]
pub trait MultiModelStore: Send + Sync {
    /// Commits events and snapshot, returning the new aggregate version.
    async fn commit(&self, commit: Commit) -> Result<u64>;

    /// Appends events without touching snapshots.
    async fn append(
        &self,
        stream: &str,
        aggregate_key: &str,
        expected_version: u64,
        events: Vec<Message>,
    ) -> Result<u64> {
        self.commit(Commit {
            stream: stream.to_string(),
            aggregate_key: aggregate_key.to_string(),
            expected_version,
            events,
            snapshot: None,
        })
        .await
    }

    async fn get_snapshot(
        &self,
        collection: &str,
        aggregate_id: &str,
    ) -> Result<Option<AggregateSnapshot>>;

    /// Number of events recorded for the aggregate in `stream`, 0 if it never existed.
    async fn aggregate_version(&self, stream: &str, aggregate_key: &str) -> Result<u64>;

    /// Events of one aggregate with a version greater than `after_version`, in order.
    async fn read_aggregate(
        &self,
        stream: &str,
        aggregate_key: &str,
        after_version: u64,
    ) -> Result<Vec<EventStreamEntry>>;

    /// At most `limit` entries of `stream` starting at sequence number `from_sequence`, in order.
    async fn read_stream(
        &self,
        stream: &str,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<EventStreamEntry>>;
}
