use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    EngineError, Message, MessageKind, Result,
    aggregate::{AggregateKey, AggregateLoader, AggregateSnapshot, LoadedAggregate},
    command::{CommandController, ContextProvider},
    config::EngineConfig,
    consumer::EventListener,
    description::{CommandDescription, CompiledDescriptions},
    flavour::{ApplyCall, DomainMessage, Flavour, FunctionKind, HandlerCall},
    message::{
        META_AGGREGATE_ID, META_AGGREGATE_TYPE, META_AGGREGATE_VERSION, META_CAUSATION_ID,
        META_CAUSATION_NAME, META_CORRELATION_ID,
    },
    projection::ProjectionTrigger,
    query::QueryResolver,
    store::{Commit, MultiModelStore, SnapshotWrite},
};

/// Result of a command processed by an aggregate.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandOutcome {
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// Aggregate version after the commit, unchanged if no event was recorded.
    pub version: u64,
    /// Committed events, in order, with their engine metadata.
    pub events: Vec<Message>,
}

/// What [`EventMachine::dispatch`] did with a message.
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatched {
    /// The command was handled by an aggregate.
    Recorded(CommandOutcome),
    /// The command was handed to a controller.
    Passed,
    /// The query was answered by a resolver.
    Answered(Value),
}

/// Builds an [`EventMachine`], binding the names used in the descriptions to implementations.
pub struct EventMachineBuilder {
    descriptions: CompiledDescriptions,
    flavour: Arc<dyn Flavour>,
    store: Arc<dyn MultiModelStore>,
    config: EngineConfig,
    context_providers: HashMap<String, Arc<dyn ContextProvider>>,
    listeners: HashMap<String, Arc<dyn EventListener>>,
    controllers: HashMap<String, Arc<dyn CommandController>>,
    resolvers: HashMap<String, Arc<dyn QueryResolver>>,
    projections: Option<ProjectionTrigger>,
}

impl EventMachineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn context_provider(
        mut self,
        name: impl Into<String>,
        provider: impl ContextProvider + 'static,
    ) -> Self {
        self.context_providers.insert(name.into(), Arc::new(provider));
        self
    }

    pub fn listener(mut self, name: impl Into<String>, listener: impl EventListener + 'static) -> Self {
        self.listeners.insert(name.into(), Arc::new(listener));
        self
    }

    pub fn controller(
        mut self,
        name: impl Into<String>,
        controller: impl CommandController + 'static,
    ) -> Self {
        self.controllers.insert(name.into(), Arc::new(controller));
        self
    }

    pub fn resolver(mut self, name: impl Into<String>, resolver: impl QueryResolver + 'static) -> Self {
        self.resolvers.insert(name.into(), Arc::new(resolver));
        self
    }

    /// Wakes a [`ProjectionEngine`](crate::ProjectionEngine) after every commit.
    pub fn notify_projections(mut self, trigger: ProjectionTrigger) -> Self {
        self.projections = Some(trigger);
        self
    }

    /// Fails if any name used in the descriptions has no implementation.
    pub fn build(self) -> Result<EventMachine> {
        let flavour = self.flavour.as_ref();
        let unknown = |kind: &'static str, reference: &str| EngineError::UnknownFunction {
            kind,
            reference: reference.to_string(),
        };

        for command in self.descriptions.commands.values() {
            if !flavour.knows_function(FunctionKind::Handler, &command.handler) {
                return Err(unknown(FunctionKind::Handler.label(), &command.handler));
            }
            for entry in &command.event_apply_map {
                if !flavour.knows_function(FunctionKind::Apply, &entry.apply) {
                    return Err(unknown(FunctionKind::Apply.label(), &entry.apply));
                }
            }
            if let Some(provider) = &command.context_provider {
                if !self.context_providers.contains_key(provider) {
                    return Err(unknown("context provider", provider));
                }
            }
        }
        for controller in self.descriptions.controllers.values() {
            if !self.controllers.contains_key(controller) {
                return Err(unknown("controller", controller));
            }
        }
        for listener in self.descriptions.listeners.values().flatten() {
            if !self.listeners.contains_key(listener) {
                return Err(unknown("listener", listener));
            }
        }
        for query in self.descriptions.queries.values() {
            if !self.resolvers.contains_key(&query.resolver) {
                return Err(unknown("resolver", &query.resolver));
            }
        }

        Ok(EventMachine {
            inner: Arc::new(Inner {
                descriptions: self.descriptions,
                flavour: self.flavour,
                store: self.store,
                config: self.config,
                context_providers: self.context_providers,
                listeners: self.listeners,
                controllers: self.controllers,
                resolvers: self.resolvers,
                projections: self.projections,
            }),
        })
    }
}

struct Inner {
    descriptions: CompiledDescriptions,
    flavour: Arc<dyn Flavour>,
    store: Arc<dyn MultiModelStore>,
    config: EngineConfig,
    context_providers: HashMap<String, Arc<dyn ContextProvider>>,
    listeners: HashMap<String, Arc<dyn EventListener>>,
    controllers: HashMap<String, Arc<dyn CommandController>>,
    resolvers: HashMap<String, Arc<dyn QueryResolver>>,
    projections: Option<ProjectionTrigger>,
}

/// The `EventMachine` executes commands end to end against event-sourced aggregates.
///
/// For each command it loads the aggregate (snapshot plus newer events, or full replay), asks the
/// flavour to run the handler, folds the recorded events into the new state and commits events and
/// snapshot in one unit. Only after a successful commit are the events handed to listeners and the
/// projection engine is woken up.
///
/// Concurrent commands on the same aggregate are not locked: the store's optimistic concurrency
/// check lets exactly one commit win and the others are reloaded and re-run up to
/// [`EngineConfig::max_concurrency_retries`] times. Clones share the same engine.
#[derive(Clone)]
pub struct EventMachine {
    inner: Arc<Inner>,
}

impl EventMachine {
    pub fn builder(
        descriptions: CompiledDescriptions,
        flavour: Arc<dyn Flavour>,
        store: Arc<dyn MultiModelStore>,
    ) -> EventMachineBuilder {
        EventMachineBuilder {
            descriptions,
            flavour,
            store,
            config: EngineConfig::default(),
            context_providers: HashMap::new(),
            listeners: HashMap::new(),
            controllers: HashMap::new(),
            resolvers: HashMap::new(),
            projections: None,
        }
    }

    pub fn descriptions(&self) -> &CompiledDescriptions {
        &self.inner.descriptions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Routes any message: commands to their aggregate or controller, queries to their resolver.
    pub async fn dispatch(&self, message: Message) -> Result<Dispatched> {
        match message.kind() {
            MessageKind::Command => {
                if let Some(controller) = self.inner.descriptions.controller(message.name()) {
                    self.pass(controller, &message).await?;
                    Ok(Dispatched::Passed)
                } else {
                    Ok(Dispatched::Recorded(self.dispatch_command(message).await?))
                }
            }
            MessageKind::Query => Ok(Dispatched::Answered(self.dispatch_query(message).await?)),
            MessageKind::Event => Err(EngineError::InvalidMessage(format!(
                "event '{}' cannot be dispatched",
                message.name()
            ))),
        }
    }

    /// Processes a command bound to an aggregate, retrying on concurrency conflicts.
    pub async fn dispatch_command(&self, command: Message) -> Result<CommandOutcome> {
        if command.kind() != MessageKind::Command {
            return Err(EngineError::InvalidMessage(format!(
                "expected a command, got {} '{}'",
                command.kind(),
                command.name()
            )));
        }
        let description = self
            .inner
            .descriptions
            .command(command.name())
            .ok_or_else(|| EngineError::UnroutedCommand {
                command: command.name().to_string(),
            })?;

        let mut attempt = 0;
        let outcome = loop {
            match self.execute(description, &command).await {
                Err(err) if err.is_transient() && attempt < self.inner.config.max_concurrency_retries => {
                    attempt += 1;
                    warn!(
                        command = command.name(),
                        attempt,
                        error = %err,
                        "retrying command after concurrency conflict"
                    );
                }
                result => break result?,
            }
        };

        self.publish(&outcome.events).await;
        Ok(outcome)
    }

    pub async fn dispatch_query(&self, query: Message) -> Result<Value> {
        let description =
            self.inner
                .descriptions
                .query(query.name())
                .ok_or_else(|| EngineError::UnroutedQuery {
                    query: query.name().to_string(),
                })?;
        let resolver = self.inner.resolvers.get(&description.resolver).ok_or_else(|| {
            EngineError::UnknownFunction {
                kind: "resolver",
                reference: description.resolver.clone(),
            }
        })?;
        debug!(query = query.name(), resolver = %description.resolver, "resolving query");
        Ok(resolver.resolve(&query).await?)
    }

    /// Current serialized state of an aggregate, `None` if it does not exist.
    pub async fn load_aggregate_state(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<AggregateSnapshot>> {
        let aggregate = self.inner.descriptions.aggregate(aggregate_type)?;
        let loaded = self.loader().load(aggregate, aggregate_id).await?;
        match loaded.state {
            Some(state) => Ok(Some(AggregateSnapshot::new(
                aggregate_type,
                aggregate_id,
                loaded.version,
                self.inner
                    .flavour
                    .serialize_state(aggregate_type, state.as_ref())?,
            ))),
            None => Ok(None),
        }
    }

    /// Recorded history of an aggregate, oldest first.
    pub async fn load_aggregate_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<Message>> {
        let aggregate = self.inner.descriptions.aggregate(aggregate_type)?;
        let key = AggregateKey::new(aggregate_type, aggregate_id).to_string();
        let entries = self
            .inner
            .store
            .read_aggregate(aggregate.stream(&self.inner.config.default_stream), &key, 0)
            .await?;
        Ok(entries.into_iter().map(|entry| entry.event).collect())
    }

    fn loader(&self) -> AggregateLoader<'_> {
        AggregateLoader::new(
            self.inner.flavour.as_ref(),
            self.inner.store.as_ref(),
            &self.inner.config,
        )
    }

    async fn pass(&self, controller: &str, command: &Message) -> Result<()> {
        let handler = self.inner.controllers.get(controller).ok_or_else(|| {
            EngineError::UnknownFunction {
                kind: "controller",
                reference: controller.to_string(),
            }
        })?;
        debug!(command = command.name(), controller, "passing command to controller");
        handler.process(command).await?;
        Ok(())
    }

    /// One load, decide, apply and commit cycle.
    async fn execute(
        &self,
        description: &CommandDescription,
        command: &Message,
    ) -> Result<CommandOutcome> {
        let inner = self.inner.as_ref();
        let flavour = inner.flavour.as_ref();
        let aggregate_type = description.aggregate_type.as_str();
        let aggregate = inner.descriptions.aggregate(aggregate_type)?;
        let stream = aggregate.stream(&inner.config.default_stream);

        let domain_command = flavour.deserialize(command)?;
        let aggregate_id =
            flavour.extract_aggregate_id(&description.identifier, domain_command.as_ref())?;
        let key = AggregateKey::new(aggregate_type, aggregate_id.as_str()).to_string();

        debug!(
            aggregate_type,
            aggregate_id = %aggregate_id,
            command = command.name(),
            is_new = description.is_new,
            "executing command"
        );

        let loaded = if description.is_new {
            if inner.store.aggregate_version(stream, &key).await? > 0 {
                return Err(EngineError::AggregateAlreadyExists {
                    aggregate_type: aggregate_type.to_string(),
                    aggregate_id,
                });
            }
            LoadedAggregate {
                state: None,
                version: 0,
            }
        } else {
            let loaded = self.loader().load(aggregate, &aggregate_id).await?;
            if !loaded.exists() {
                return Err(EngineError::AggregateNotFound {
                    aggregate_type: aggregate_type.to_string(),
                    aggregate_id,
                });
            }
            loaded
        };

        let context = match &description.context_provider {
            Some(name) => {
                let provider = inner.context_providers.get(name).ok_or_else(|| {
                    EngineError::UnknownFunction {
                        kind: "context provider",
                        reference: name.clone(),
                    }
                })?;
                let context = provider
                    .provide(domain_command.as_ref())
                    .await
                    .map_err(|source| EngineError::ContextProvider {
                        provider: name.clone(),
                        command: command.name().to_string(),
                        source,
                    })?;
                Some(context)
            }
            None => None,
        };

        let yielded: Vec<DomainMessage> = flavour
            .invoke_handler(HandlerCall {
                aggregate_type,
                aggregate_id: &aggregate_id,
                command_name: command.name(),
                handler: &description.handler,
                state: loaded.state.as_deref(),
                command: domain_command.as_ref(),
                context: context.as_deref(),
            })?
            .collect();

        let expected_version = loaded.version;
        if yielded.is_empty() {
            if inner.config.reject_empty_yield {
                return Err(EngineError::DomainRejection {
                    aggregate_type: aggregate_type.to_string(),
                    aggregate_id,
                    command: command.name().to_string(),
                    reason: "no event recorded".to_string(),
                });
            }
            debug!(aggregate = %key, "handler recorded no event");
            return Ok(CommandOutcome {
                aggregate_type: aggregate_type.to_string(),
                aggregate_id,
                version: expected_version,
                events: Vec::new(),
            });
        }

        let correlation_id = command.correlation_id();
        let causation_id = command.id().to_string();
        let mut state = loaded.state;
        let mut version = expected_version;
        let mut events = Vec::with_capacity(yielded.len());

        for event in yielded {
            let decorated = flavour.decorate_event(event)?;
            let event_name = decorated.name().to_string();
            let apply =
                description
                    .apply_for(&event_name)
                    .ok_or_else(|| EngineError::UnmappedEvent {
                        command: command.name().to_string(),
                        event: event_name.clone(),
                    })?;

            version += 1;
            state = Some(flavour.invoke_apply(
                ApplyCall {
                    aggregate_type,
                    event_name: &event_name,
                    apply,
                },
                state.take(),
                decorated.event(),
            )?);

            let message = decorated
                .message()
                .with_added_metadata(META_AGGREGATE_TYPE, aggregate_type)
                .with_added_metadata(META_AGGREGATE_ID, aggregate_id.as_str())
                .with_added_metadata(META_AGGREGATE_VERSION, version)
                .with_added_metadata(META_CAUSATION_ID, causation_id.as_str())
                .with_added_metadata(META_CAUSATION_NAME, command.name())
                .with_added_metadata(META_CORRELATION_ID, correlation_id.as_str());
            events.push(message);
        }

        let snapshot = match state.as_deref() {
            Some(state) if inner.config.snapshots.should_snapshot(expected_version, version) => {
                Some(SnapshotWrite {
                    collection: aggregate.collection(),
                    snapshot: AggregateSnapshot::new(
                        aggregate_type,
                        aggregate_id.as_str(),
                        version,
                        flavour.serialize_state(aggregate_type, state)?,
                    ),
                })
            }
            _ => None,
        };

        let committed = inner
            .store
            .commit(Commit {
                stream: stream.to_string(),
                aggregate_key: key.clone(),
                expected_version,
                events: events.clone(),
                snapshot,
            })
            .await?;

        debug!(
            aggregate = %key,
            version = committed,
            events = events.len(),
            "committed events"
        );

        Ok(CommandOutcome {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
            version: committed,
            events,
        })
    }

    async fn publish(&self, events: &[Message]) {
        for event in events {
            for name in self.inner.descriptions.listeners_of(event.name()) {
                let Some(listener) = self.inner.listeners.get(name) else {
                    continue;
                };
                if let Err(err) = listener.on_event(event).await {
                    error!(
                        listener = %name,
                        event = event.name(),
                        error = %err,
                        "event listener failed"
                    );
                }
            }
        }

        if !events.is_empty() {
            if let Some(trigger) = &self.inner.projections {
                trigger.notify();
            }
        }
    }
}
