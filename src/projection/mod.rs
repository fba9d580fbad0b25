use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{Message, aggregate::AggregateKey, store::DocumentStore};

pub mod engine;

pub use engine::{ProjectionEngine, ProjectionEngineBuilder};

/// Collection holding one cursor document per projection name and version.
pub const CURSOR_COLLECTION: &str = "projection_cursors";

/// Collection recording which version of each projection answers queries.
pub const VERSION_COLLECTION: &str = "projection_versions";

/// The `Projector` trait builds one read model from the event feed.
///
/// Every method receives the projection version and name so that several versions of a read
/// model can live side by side while one of them is rebuilt. Delivery is at least once: `handle`
/// may see the same event again after a failure or a restart and must leave the read model
/// unchanged in that case, which id-keyed upserts achieve naturally.
#[async_trait]
pub trait Projector: Send + Sync {
    /// Idempotent setup, called before every run.
    async fn prepare_for_run(&self, version: u32, name: &str) -> anyhow::Result<()>;

    async fn handle(&self, version: u32, name: &str, event: &Message) -> anyhow::Result<()>;

    async fn delete_read_model(&self, version: u32, name: &str) -> anyhow::Result<()>;
}

/// Name of the collection holding version `version` of read model `name`.
pub fn read_model_collection(name: &str, version: u32) -> String {
    format!("{name}_v{version}")
}

/// Position of one projection version in its stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionCursor {
    pub projection: String,
    pub version: u32,
    /// Sequence number of the last event handled, 0 before the first one.
    pub last_processed: u64,
}

impl ProjectionCursor {
    pub fn new(projection: impl Into<String>, version: u32) -> Self {
        Self {
            projection: projection.into(),
            version,
            last_processed: 0,
        }
    }

    pub fn id(&self) -> String {
        cursor_id(&self.projection, self.version)
    }
}

pub(crate) fn cursor_id(projection: &str, version: u32) -> String {
    format!("{projection}-{version}")
}

/// Handle given to the [`EventMachine`](crate::EventMachine) to wake the projection engine after
/// a commit. Notifying never blocks: pending wake-ups are coalesced.
#[derive(Clone, Debug)]
pub struct ProjectionTrigger(mpsc::Sender<()>);

impl ProjectionTrigger {
    pub fn notify(&self) {
        // Full means a wake-up is already pending.
        let _ = self.0.try_send(());
    }
}

/// Receiving side of [`ProjectionTrigger`], consumed by [`ProjectionEngine::run`].
#[derive(Debug)]
pub struct ProjectionWakeups(mpsc::Receiver<()>);

impl ProjectionWakeups {
    /// Waits for the next notification; false once every trigger is dropped.
    pub async fn next(&mut self) -> bool {
        self.0.recv().await.is_some()
    }
}

pub fn projection_trigger() -> (ProjectionTrigger, ProjectionWakeups) {
    let (tx, rx) = mpsc::channel(1);
    (ProjectionTrigger(tx), ProjectionWakeups(rx))
}

/// Keeps the latest known state of every aggregate of the watched events, one document per
/// aggregate in [`read_model_collection`].
///
/// Documents are keyed by [`AggregateKey`] (`"{type}-{id}"`) so aggregates of different types
/// sharing an id stay apart; events without an aggregate type fall back to the bare id. Each
/// event's payload is merged into the aggregate's document together with its `_version`. Events
/// at or below the stored version are skipped, so redelivered events change nothing.
#[derive(Clone)]
pub struct AggregateStateProjector {
    documents: Arc<dyn DocumentStore>,
}

impl AggregateStateProjector {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl Projector for AggregateStateProjector {
    async fn prepare_for_run(&self, version: u32, name: &str) -> anyhow::Result<()> {
        self.documents
            .add_collection(&read_model_collection(name, version))
            .await?;
        Ok(())
    }

    async fn handle(&self, version: u32, name: &str, event: &Message) -> anyhow::Result<()> {
        let Some(id) = event.aggregate_id() else {
            return Ok(());
        };
        let key = match event.aggregate_type() {
            Some(aggregate_type) => AggregateKey::new(aggregate_type, id).to_string(),
            None => id.to_string(),
        };
        let collection = read_model_collection(name, version);
        let event_version = event.aggregate_version().unwrap_or(0);

        let mut doc = match self.documents.get_doc(&collection, &key).await? {
            Some(Value::Object(doc)) => doc,
            _ => Default::default(),
        };
        let stored_version = doc.get("_version").and_then(Value::as_u64).unwrap_or(0);
        if event_version != 0 && event_version <= stored_version {
            return Ok(());
        }

        for (field, value) in event.payload() {
            doc.insert(field.clone(), value.clone());
        }
        doc.insert("_id".to_string(), Value::from(id));
        if let Some(aggregate_type) = event.aggregate_type() {
            doc.insert("_aggregate_type".to_string(), Value::from(aggregate_type));
        }
        doc.insert("_version".to_string(), Value::from(event_version));
        self.documents
            .upsert_doc(&collection, &key, Value::Object(doc))
            .await?;
        Ok(())
    }

    async fn delete_read_model(&self, version: u32, name: &str) -> anyhow::Result<()> {
        self.documents
            .drop_collection(&read_model_collection(name, version))
            .await?;
        Ok(())
    }
}
