use tracing::debug;

use crate::{
    EngineError, Result,
    aggregate::AggregateKey,
    config::EngineConfig,
    description::AggregateDescription,
    flavour::{ApplyCall, DomainState, Flavour},
    store::{EventStreamEntry, MultiModelStore},
};

/// Current state of an aggregate instance and the version it was read at.
pub struct LoadedAggregate {
    /// `None` when the aggregate has neither a snapshot nor any recorded event.
    pub state: Option<DomainState>,
    pub version: u64,
}

impl LoadedAggregate {
    pub fn exists(&self) -> bool {
        self.version > 0
    }
}

/// Rebuilds aggregate state from the multi-model store.
///
/// With snapshots enabled the latest snapshot is decoded and only the events recorded after its
/// version are replayed on top of it; otherwise the whole history is folded from the start.
pub struct AggregateLoader<'a> {
    flavour: &'a dyn Flavour,
    store: &'a dyn MultiModelStore,
    config: &'a EngineConfig,
}

impl<'a> AggregateLoader<'a> {
    pub fn new(
        flavour: &'a dyn Flavour,
        store: &'a dyn MultiModelStore,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            flavour,
            store,
            config,
        }
    }

    pub async fn load(
        &self,
        aggregate: &AggregateDescription,
        aggregate_id: &str,
    ) -> Result<LoadedAggregate> {
        let key = AggregateKey::new(aggregate.aggregate_type.as_str(), aggregate_id).to_string();
        let stream = aggregate.stream(&self.config.default_stream);

        let mut loaded = LoadedAggregate {
            state: None,
            version: 0,
        };

        if self.config.snapshots.enabled {
            if let Some(snapshot) = self
                .store
                .get_snapshot(&aggregate.collection(), aggregate_id)
                .await?
            {
                debug!(
                    aggregate = %key,
                    version = snapshot.version,
                    "loaded aggregate snapshot"
                );
                loaded.state = Some(
                    self.flavour
                        .deserialize_state(&aggregate.aggregate_type, snapshot.state)?,
                );
                loaded.version = snapshot.version;
            }
        }

        let entries = self
            .store
            .read_aggregate(stream, &key, loaded.version)
            .await?;
        debug!(aggregate = %key, replayed = entries.len(), "replaying aggregate events");

        for entry in entries {
            loaded.state = Some(self.fold(aggregate, loaded.state.take(), &entry)?);
            loaded.version = entry.aggregate_version;
        }

        Ok(loaded)
    }

    fn fold(
        &self,
        aggregate: &AggregateDescription,
        state: Option<DomainState>,
        entry: &EventStreamEntry,
    ) -> Result<DomainState> {
        let name = entry.event.name();
        let apply = aggregate.apply_for(name).ok_or_else(|| {
            EngineError::InvalidDescription(format!(
                "event '{name}' recorded for aggregate {} has no apply function",
                entry.aggregate_key
            ))
        })?;
        let event = self.flavour.deserialize(&entry.event)?;
        self.flavour.invoke_apply(
            ApplyCall {
                aggregate_type: &aggregate.aggregate_type,
                event_name: name,
                apply,
            },
            state,
            event.as_ref(),
        )
    }
}
