use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `AggregateSnapshot` struct is a copy of an aggregate's serialized state at a given version.
///
/// Snapshots are written in the same commit as the events that produced them, so `version` always
/// equals the number of events folded into `state`. Loading an aggregate starts from the latest
/// snapshot and only replays the events recorded after it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// The domain identifier of the aggregate.
    pub aggregate_id: String,

    pub aggregate_type: String,

    /// Number of events applied to produce `state`.
    pub version: u64,

    /// State as serialized by the flavour.
    pub state: Value,
}

impl AggregateSnapshot {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        version: u64,
        state: Value,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            version,
            state,
        }
    }

    /// Document form stored in the snapshot collection, keyed by the aggregate id.
    pub fn to_document(&self) -> Value {
        serde_json::json!({
            "id": self.aggregate_id,
            "aggregate_type": self.aggregate_type,
            "version": self.version,
            "state": self.state,
        })
    }

    pub fn from_document(document: &Value) -> Option<Self> {
        Some(Self {
            aggregate_id: document.get("id")?.as_str()?.to_string(),
            aggregate_type: document.get("aggregate_type")?.as_str()?.to_string(),
            version: document.get("version")?.as_u64()?,
            state: document.get("state")?.clone(),
        })
    }
}
