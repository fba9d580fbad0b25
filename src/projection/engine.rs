use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    EngineError, Message, Result,
    config::ProjectionConfig,
    description::{CompiledDescriptions, ProjectionDescription},
    projection::{
        CURSOR_COLLECTION, ProjectionCursor, ProjectionWakeups, Projector, VERSION_COLLECTION,
        cursor_id,
    },
    store::{DocumentStore, MultiModelStore},
};

/// Version a projection starts with when it was never rebuilt.
const INITIAL_VERSION: u32 = 1;

pub struct ProjectionEngineBuilder {
    descriptions: Vec<ProjectionDescription>,
    events: Arc<dyn MultiModelStore>,
    documents: Arc<dyn DocumentStore>,
    config: ProjectionConfig,
    projectors: HashMap<String, Arc<dyn Projector>>,
}

impl ProjectionEngineBuilder {
    pub fn config(mut self, config: ProjectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn projector(mut self, name: impl Into<String>, projector: impl Projector + 'static) -> Self {
        self.projectors.insert(name.into(), Arc::new(projector));
        self
    }

    pub fn build(self) -> Result<ProjectionEngine> {
        for description in &self.descriptions {
            if !self.projectors.contains_key(&description.projector) {
                return Err(EngineError::UnknownFunction {
                    kind: "projector",
                    reference: description.projector.clone(),
                });
            }
        }
        Ok(ProjectionEngine {
            descriptions: self.descriptions,
            events: self.events,
            documents: self.documents,
            config: self.config,
            projectors: self.projectors,
            active_versions: RwLock::new(HashMap::new()),
            paused: RwLock::new(HashSet::new()),
            run_lock: Mutex::new(()),
        })
    }
}

/// The `ProjectionEngine` feeds committed events to projectors and tracks their progress.
///
/// Each projection reads its stream from the event after its cursor, filters events by name and
/// hands them to its projector one at a time. The cursor, persisted in the
/// [`CURSOR_COLLECTION`] documents, only moves once the projector accepted the event; a failing
/// event is retried with a linear backoff, and if it keeps failing the projection stops at that
/// event until the next pass while the other projections carry on.
///
/// Rebuilding replays the whole stream into a new version of the read model next to the active
/// one, then switches queries to it and drops the old version.
pub struct ProjectionEngine {
    descriptions: Vec<ProjectionDescription>,
    events: Arc<dyn MultiModelStore>,
    documents: Arc<dyn DocumentStore>,
    config: ProjectionConfig,
    projectors: HashMap<String, Arc<dyn Projector>>,
    active_versions: RwLock<HashMap<String, u32>>,
    paused: RwLock<HashSet<String>>,
    run_lock: Mutex<()>,
}

impl ProjectionEngine {
    pub fn builder(
        descriptions: &CompiledDescriptions,
        events: Arc<dyn MultiModelStore>,
        documents: Arc<dyn DocumentStore>,
    ) -> ProjectionEngineBuilder {
        ProjectionEngineBuilder {
            descriptions: descriptions.projections.clone(),
            events,
            documents,
            config: ProjectionConfig::default(),
            projectors: HashMap::new(),
        }
    }

    /// Catches up after every wake-up until all triggers are dropped.
    pub async fn run(&self, mut wakeups: ProjectionWakeups) {
        loop {
            if let Err(err) = self.catch_up().await {
                error!(error = %err, "projection catch-up failed");
            }
            if !wakeups.next().await {
                debug!("projection triggers dropped, stopping");
                return;
            }
        }
    }

    /// Runs every projection up to the end of its stream and returns the number of events handled.
    ///
    /// A failing projector only stops its own projection; storage failures abort the pass.
    pub async fn catch_up(&self) -> Result<usize> {
        let mut handled = 0;
        for description in &self.descriptions {
            match self.catch_up_projection(&description.name).await {
                Ok(count) => handled += count,
                Err(err @ EngineError::Projection { .. }) => {
                    error!(
                        projection = %description.name,
                        error = %err,
                        "projection stopped on failing event"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(handled)
    }

    /// Runs one projection up to the end of its stream, unless it is paused.
    pub async fn catch_up_projection(&self, name: &str) -> Result<usize> {
        let description = self.description(name)?;
        let _running = self.run_lock.lock().await;
        if self.is_paused(name).await {
            debug!(projection = name, "projection paused, skipping");
            return Ok(0);
        }
        let version = self.active_version(name).await?;
        self.run_version(description, version, Replay::UntilPaused)
            .await
    }

    pub async fn pause(&self, name: &str) -> Result<()> {
        self.description(name)?;
        self.paused.write().await.insert(name.to_string());
        info!(projection = name, "projection paused");
        Ok(())
    }

    pub async fn resume(&self, name: &str) -> Result<()> {
        self.description(name)?;
        self.paused.write().await.remove(name);
        info!(projection = name, "projection resumed");
        Ok(())
    }

    pub async fn is_paused(&self, name: &str) -> bool {
        self.paused.read().await.contains(name)
    }

    /// Version of the read model currently answering queries.
    pub async fn active_version(&self, name: &str) -> Result<u32> {
        if let Some(version) = self.active_versions.read().await.get(name) {
            return Ok(*version);
        }
        let version = self
            .documents
            .get_doc(VERSION_COLLECTION, name)
            .await?
            .and_then(|doc| doc.get("version").and_then(Value::as_u64))
            .and_then(|version| u32::try_from(version).ok())
            .unwrap_or(INITIAL_VERSION);
        self.active_versions
            .write()
            .await
            .insert(name.to_string(), version);
        Ok(version)
    }

    pub async fn cursor(&self, name: &str, version: u32) -> Result<ProjectionCursor> {
        match self
            .documents
            .get_doc(CURSOR_COLLECTION, &cursor_id(name, version))
            .await?
        {
            Some(doc) => serde_json::from_value(doc).map_err(|source| {
                EngineError::MalformedPayload {
                    name: format!("cursor of projection '{name}'"),
                    source,
                }
            }),
            None => Ok(ProjectionCursor::new(name, version)),
        }
    }

    /// Replays the whole stream into `new_version` of the read model, makes it the active
    /// version and deletes the previous one.
    ///
    /// The replay ignores a pause: a paused projection stays paused on its new version. The swap
    /// only happens once the new version's cursor reached the end of the stream.
    pub async fn rebuild(&self, name: &str, new_version: u32) -> Result<usize> {
        let description = self.description(name)?;
        let projector = self.projector(description)?;
        let _running = self.run_lock.lock().await;

        let old_version = self.active_version(name).await?;
        if new_version == old_version {
            return Err(EngineError::InvalidDescription(format!(
                "projection '{name}' is already at version {new_version}"
            )));
        }
        info!(projection = name, old_version, new_version, "rebuilding projection");

        projector
            .delete_read_model(new_version, name)
            .await
            .map_err(|source| projection_error(name, "delete read model", source))?;
        self.documents
            .delete_doc(CURSOR_COLLECTION, &cursor_id(name, new_version))
            .await?;

        let handled = self
            .run_version(description, new_version, Replay::ToEnd)
            .await?;
        let cursor = self.cursor(name, new_version).await?;
        let remaining = self
            .events
            .read_stream(&description.stream, cursor.last_processed + 1, 1)
            .await?;
        if !remaining.is_empty() {
            return Err(projection_error(
                name,
                "rebuild",
                anyhow::anyhow!(
                    "replay stopped at position {} before the end of stream '{}'",
                    cursor.last_processed,
                    description.stream
                ),
            ));
        }

        self.documents
            .upsert_doc(
                VERSION_COLLECTION,
                name,
                json!({"name": name, "version": new_version}),
            )
            .await?;
        self.active_versions
            .write()
            .await
            .insert(name.to_string(), new_version);
        info!(projection = name, version = new_version, "projection version swapped");

        if let Err(source) = projector.delete_read_model(old_version, name).await {
            warn!(
                projection = name,
                version = old_version,
                error = %source,
                "failed to delete previous read model"
            );
        }
        self.documents
            .delete_doc(CURSOR_COLLECTION, &cursor_id(name, old_version))
            .await?;

        Ok(handled)
    }

    fn description(&self, name: &str) -> Result<&ProjectionDescription> {
        self.descriptions
            .iter()
            .find(|description| description.name == name)
            .ok_or_else(|| {
                EngineError::InvalidDescription(format!("unknown projection '{name}'"))
            })
    }

    fn projector(&self, description: &ProjectionDescription) -> Result<&Arc<dyn Projector>> {
        self.projectors
            .get(&description.projector)
            .ok_or_else(|| EngineError::UnknownFunction {
                kind: "projector",
                reference: description.projector.clone(),
            })
    }

    async fn run_version(
        &self,
        description: &ProjectionDescription,
        version: u32,
        replay: Replay,
    ) -> Result<usize> {
        let name = description.name.as_str();
        let projector = self.projector(description)?;
        projector
            .prepare_for_run(version, name)
            .await
            .map_err(|source| projection_error(name, "prepare for run", source))?;

        let mut cursor = self.cursor(name, version).await?;
        let mut handled = 0;

        loop {
            if replay == Replay::UntilPaused && self.is_paused(name).await {
                break;
            }
            let batch = self
                .events
                .read_stream(
                    &description.stream,
                    cursor.last_processed + 1,
                    self.config.batch_size.max(1),
                )
                .await?;
            if batch.is_empty() {
                break;
            }

            for entry in batch {
                if description.accepts(entry.event.name()) {
                    self.deliver(projector.as_ref(), name, version, &entry.event)
                        .await?;
                    handled += 1;
                }
                cursor.last_processed = entry.sequence_no;
                self.save_cursor(&cursor).await?;
            }
        }

        debug!(
            projection = name,
            version,
            position = cursor.last_processed,
            handled,
            "projection caught up"
        );
        Ok(handled)
    }

    async fn deliver(
        &self,
        projector: &dyn Projector,
        name: &str,
        version: u32,
        event: &Message,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match projector.handle(version, name, event).await {
                Ok(()) => return Ok(()),
                Err(source) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        projection = name,
                        event = event.name(),
                        attempt,
                        error = %source,
                        "projector failed, retrying"
                    );
                    let backoff = self.config.retry_backoff_ms.saturating_mul(u64::from(attempt));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(source) => return Err(projection_error(name, event.name(), source)),
            }
        }
    }

    async fn save_cursor(&self, cursor: &ProjectionCursor) -> Result<()> {
        let doc = serde_json::to_value(cursor).map_err(|source| EngineError::MalformedPayload {
            name: format!("cursor of projection '{}'", cursor.projection),
            source,
        })?;
        self.documents
            .upsert_doc(CURSOR_COLLECTION, &cursor.id(), doc)
            .await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Replay {
    /// Catch-up pass, stops early when the projection gets paused.
    UntilPaused,
    ToEnd,
}

fn projection_error(name: &str, event: &str, source: anyhow::Error) -> EngineError {
    EngineError::Projection {
        projection: name.to_string(),
        event: event.to_string(),
        source,
    }
}
