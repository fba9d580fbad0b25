use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::{
    EngineError, Result,
    description::{
        AggregateDescription, CommandDescription, CompiledDescriptions, DEFAULT_IDENTIFIER,
        EventApply, ProjectionDescription, QueryDescription,
    },
};

#[derive(Debug, Default)]
struct ProcessDraft {
    command: String,
    aggregate_type: Option<String>,
    is_new: bool,
    identifier: Option<String>,
    context_provider: Option<String>,
    handler: Option<String>,
    events: Vec<(String, Option<String>)>,
    state_collection: Option<String>,
    event_stream: Option<String>,
}

#[derive(Debug, Default)]
struct QueryDraft {
    schema: Option<Value>,
    resolver: Option<String>,
}

#[derive(Debug)]
struct ProjectionDraft {
    stream: String,
    name: Option<String>,
    projector: Option<String>,
    event_filter: Option<Vec<String>>,
}

/// Collects declarative registrations and compiles them into [`CompiledDescriptions`].
///
/// Builder calls never fail on their own: problems are collected and reported by
/// [`compile`](Registry::compile), so that a misconfigured application fails at startup, before a
/// single command is dispatched.
///
/// ```rust,ignore
/// let mut registry = Registry::new();
/// registry.register_command("AddBuilding", json!({"type": "object"}));
/// registry.register_event("BuildingAdded", json!({"type": "object"}));
/// registry
///     .process("AddBuilding")
///     .with_new("Building")
///     .identified_by("buildingId")
///     .handle("Building::add")
///     .record_that("BuildingAdded")
///     .apply("Building::whenBuildingAdded");
/// let descriptions = registry.compile()?;
/// ```
#[derive(Debug, Default)]
pub struct Registry {
    commands: BTreeMap<String, Value>,
    events: BTreeMap<String, Value>,
    queries: BTreeMap<String, QueryDraft>,
    processes: Vec<ProcessDraft>,
    controllers: Vec<(String, String)>,
    listeners: Vec<(String, String)>,
    projections: Vec<ProjectionDraft>,
    errors: Vec<EngineError>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command(&mut self, name: impl Into<String>, schema: Value) -> &mut Self {
        let name = name.into();
        if self.commands.insert(name.clone(), schema).is_some() {
            self.errors.push(EngineError::InvalidDescription(format!(
                "command '{name}' registered twice"
            )));
        }
        self
    }

    pub fn register_event(&mut self, name: impl Into<String>, schema: Value) -> &mut Self {
        let name = name.into();
        if self.events.insert(name.clone(), schema).is_some() {
            self.errors.push(EngineError::InvalidDescription(format!(
                "event '{name}' registered twice"
            )));
        }
        self
    }

    pub fn register_query(&mut self, name: impl Into<String>, schema: Option<Value>) -> QueryBuilder<'_> {
        let name = name.into();
        if self.queries.contains_key(&name) {
            self.errors.push(EngineError::InvalidDescription(format!(
                "query '{name}' registered twice"
            )));
        }
        self.queries.insert(
            name.clone(),
            QueryDraft {
                schema,
                resolver: None,
            },
        );
        QueryBuilder {
            registry: self,
            name,
        }
    }

    /// Starts describing how `command` is processed by an aggregate.
    pub fn process(&mut self, command: impl Into<String>) -> ProcessBuilder<'_> {
        self.processes.push(ProcessDraft {
            command: command.into(),
            ..ProcessDraft::default()
        });
        let index = self.processes.len() - 1;
        ProcessBuilder {
            registry: self,
            index,
        }
    }

    /// Routes `command` to a controller instead of an aggregate.
    pub fn pass(&mut self, command: impl Into<String>, controller: impl Into<String>) -> &mut Self {
        self.controllers.push((command.into(), controller.into()));
        self
    }

    /// Registers a listener invoked with every committed `event`.
    pub fn on(&mut self, event: impl Into<String>, listener: impl Into<String>) -> &mut Self {
        self.listeners.push((event.into(), listener.into()));
        self
    }

    pub fn watch(&mut self, stream: impl Into<String>) -> ProjectionBuilder<'_> {
        self.projections.push(ProjectionDraft {
            stream: stream.into(),
            name: None,
            projector: None,
            event_filter: None,
        });
        let index = self.projections.len() - 1;
        ProjectionBuilder {
            registry: self,
            index,
        }
    }

    pub fn compile(mut self) -> Result<CompiledDescriptions> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }

        let mut compiled = CompiledDescriptions {
            command_schemas: self.commands.clone(),
            event_schemas: self.events.clone(),
            ..CompiledDescriptions::default()
        };

        self.compile_controllers(&mut compiled)?;
        let identifiers = self.aggregate_identifiers()?;
        self.compile_processes(&mut compiled, &identifiers)?;
        self.compile_aggregates(&mut compiled)?;
        self.compile_queries(&mut compiled)?;
        self.compile_listeners(&mut compiled)?;
        self.compile_projections(&mut compiled)?;

        Ok(compiled)
    }

    fn compile_controllers(&self, compiled: &mut CompiledDescriptions) -> Result<()> {
        for (command, controller) in &self.controllers {
            self.ensure_command(command)?;
            if compiled
                .controllers
                .insert(command.clone(), controller.clone())
                .is_some()
            {
                return Err(EngineError::DuplicateHandler {
                    command: command.clone(),
                });
            }
        }
        Ok(())
    }

    /// Resolves the identifier field of each aggregate type; an explicit field on any command
    /// applies to all commands of that type.
    fn aggregate_identifiers(&self) -> Result<BTreeMap<String, String>> {
        let mut identifiers: BTreeMap<String, String> = BTreeMap::new();
        for draft in &self.processes {
            let (Some(aggregate_type), Some(identifier)) = (&draft.aggregate_type, &draft.identifier)
            else {
                continue;
            };
            match identifiers.get(aggregate_type) {
                Some(known) if known != identifier => {
                    return Err(EngineError::InvalidDescription(format!(
                        "aggregate '{aggregate_type}' is identified by both '{known}' and '{identifier}'"
                    )));
                }
                Some(_) => {}
                None => {
                    identifiers.insert(aggregate_type.clone(), identifier.clone());
                }
            }
        }
        Ok(identifiers)
    }

    fn compile_processes(
        &self,
        compiled: &mut CompiledDescriptions,
        identifiers: &BTreeMap<String, String>,
    ) -> Result<()> {
        for draft in &self.processes {
            self.ensure_command(&draft.command)?;
            if compiled.controllers.contains_key(&draft.command)
                || compiled.commands.contains_key(&draft.command)
            {
                return Err(EngineError::DuplicateHandler {
                    command: draft.command.clone(),
                });
            }

            let aggregate_type = draft.aggregate_type.clone().ok_or_else(|| {
                EngineError::InvalidDescription(format!(
                    "command '{}' has no aggregate type, call with_new or with_existing",
                    draft.command
                ))
            })?;
            let handler = draft.handler.clone().ok_or_else(|| {
                EngineError::InvalidDescription(format!(
                    "command '{}' has no handler",
                    draft.command
                ))
            })?;

            let mut event_apply_map: Vec<EventApply> = Vec::with_capacity(draft.events.len());
            for (event, apply) in &draft.events {
                if !self.events.contains_key(event) {
                    return Err(EngineError::InvalidDescription(format!(
                        "command '{}' records unregistered event '{event}'",
                        draft.command
                    )));
                }
                let apply = apply.clone().ok_or_else(|| EngineError::UnmappedEvent {
                    command: draft.command.clone(),
                    event: event.clone(),
                })?;
                if event_apply_map.iter().any(|entry| &entry.event == event) {
                    return Err(EngineError::InvalidDescription(format!(
                        "command '{}' records event '{event}' twice",
                        draft.command
                    )));
                }
                event_apply_map.push(EventApply {
                    event: event.clone(),
                    apply,
                });
            }

            let identifier = identifiers
                .get(&aggregate_type)
                .cloned()
                .unwrap_or_else(|| DEFAULT_IDENTIFIER.to_string());

            compiled.commands.insert(
                draft.command.clone(),
                CommandDescription {
                    command_name: draft.command.clone(),
                    aggregate_type,
                    is_new: draft.is_new,
                    identifier,
                    context_provider: draft.context_provider.clone(),
                    handler,
                    event_apply_map,
                    state_collection: draft.state_collection.clone(),
                    event_stream: draft.event_stream.clone(),
                },
            );
        }
        Ok(())
    }

    /// Merges command descriptions into per-aggregate descriptions and pushes aggregate-wide
    /// overrides back to every command of the type.
    fn compile_aggregates(&self, compiled: &mut CompiledDescriptions) -> Result<()> {
        for command in compiled.commands.values() {
            let aggregate = compiled
                .aggregates
                .entry(command.aggregate_type.clone())
                .or_insert_with(|| AggregateDescription {
                    aggregate_type: command.aggregate_type.clone(),
                    identifier: command.identifier.clone(),
                    event_apply_map: Vec::new(),
                    state_collection: None,
                    event_stream: None,
                });

            for entry in &command.event_apply_map {
                match aggregate.apply_for(&entry.event) {
                    Some(apply) if apply != entry.apply => {
                        return Err(EngineError::InvalidDescription(format!(
                            "event '{}' of aggregate '{}' is applied by both '{apply}' and '{}'",
                            entry.event, aggregate.aggregate_type, entry.apply
                        )));
                    }
                    Some(_) => {}
                    None => aggregate.event_apply_map.push(entry.clone()),
                }
            }

            merge_override(
                &mut aggregate.state_collection,
                &command.state_collection,
                "state collection",
                &aggregate.aggregate_type,
            )?;
            merge_override(
                &mut aggregate.event_stream,
                &command.event_stream,
                "event stream",
                &aggregate.aggregate_type,
            )?;
        }

        for command in compiled.commands.values_mut() {
            if let Some(aggregate) = compiled.aggregates.get(&command.aggregate_type) {
                command.state_collection = aggregate.state_collection.clone();
                command.event_stream = aggregate.event_stream.clone();
            }
        }

        Ok(())
    }

    fn compile_queries(&self, compiled: &mut CompiledDescriptions) -> Result<()> {
        for (name, draft) in &self.queries {
            let resolver = draft.resolver.clone().ok_or_else(|| {
                EngineError::InvalidDescription(format!("query '{name}' has no resolver"))
            })?;
            compiled.queries.insert(
                name.clone(),
                QueryDescription {
                    name: name.clone(),
                    schema: draft.schema.clone(),
                    resolver,
                },
            );
        }
        Ok(())
    }

    fn compile_listeners(&self, compiled: &mut CompiledDescriptions) -> Result<()> {
        for (event, listener) in &self.listeners {
            self.ensure_event(event)?;
            compiled
                .listeners
                .entry(event.clone())
                .or_default()
                .push(listener.clone());
        }
        Ok(())
    }

    fn compile_projections(&self, compiled: &mut CompiledDescriptions) -> Result<()> {
        let mut names = BTreeSet::new();
        for draft in &self.projections {
            let (Some(name), Some(projector)) = (&draft.name, &draft.projector) else {
                return Err(EngineError::InvalidDescription(format!(
                    "projection watching '{}' has no name or projector",
                    draft.stream
                )));
            };
            if !names.insert(name.clone()) {
                return Err(EngineError::InvalidDescription(format!(
                    "projection '{name}' registered twice"
                )));
            }
            if let Some(filter) = &draft.event_filter {
                for event in filter {
                    self.ensure_event(event)?;
                }
            }
            compiled.projections.push(ProjectionDescription {
                name: name.clone(),
                stream: draft.stream.clone(),
                projector: projector.clone(),
                event_filter: draft.event_filter.clone(),
            });
        }
        Ok(())
    }

    fn ensure_command(&self, command: &str) -> Result<()> {
        if self.commands.contains_key(command) {
            Ok(())
        } else {
            Err(EngineError::InvalidDescription(format!(
                "command '{command}' is routed but was never registered"
            )))
        }
    }

    fn ensure_event(&self, event: &str) -> Result<()> {
        if self.events.contains_key(event) {
            Ok(())
        } else {
            Err(EngineError::InvalidDescription(format!(
                "event '{event}' is referenced but was never registered"
            )))
        }
    }
}

fn merge_override(
    target: &mut Option<String>,
    source: &Option<String>,
    what: &str,
    aggregate_type: &str,
) -> Result<()> {
    match (target.as_ref(), source) {
        (Some(current), Some(other)) if current != other => {
            Err(EngineError::InvalidDescription(format!(
                "aggregate '{aggregate_type}' uses both '{current}' and '{other}' as {what}"
            )))
        }
        (None, Some(other)) => {
            *target = Some(other.clone());
            Ok(())
        }
        _ => Ok(()),
    }
}

pub struct QueryBuilder<'a> {
    registry: &'a mut Registry,
    name: String,
}

impl QueryBuilder<'_> {
    pub fn resolve_with(self, resolver: impl Into<String>) {
        if let Some(draft) = self.registry.queries.get_mut(&self.name) {
            draft.resolver = Some(resolver.into());
        }
    }
}

/// Chainable description of one command's lifecycle.
pub struct ProcessBuilder<'a> {
    registry: &'a mut Registry,
    index: usize,
}

impl<'a> ProcessBuilder<'a> {
    fn draft(&mut self) -> &mut ProcessDraft {
        &mut self.registry.processes[self.index]
    }

    /// The command creates a new aggregate instance.
    pub fn with_new(mut self, aggregate_type: impl Into<String>) -> Self {
        let draft = self.draft();
        draft.aggregate_type = Some(aggregate_type.into());
        draft.is_new = true;
        self
    }

    /// The command addresses an aggregate instance that must already exist.
    pub fn with_existing(mut self, aggregate_type: impl Into<String>) -> Self {
        let draft = self.draft();
        draft.aggregate_type = Some(aggregate_type.into());
        draft.is_new = false;
        self
    }

    pub fn identified_by(mut self, field: impl Into<String>) -> Self {
        self.draft().identifier = Some(field.into());
        self
    }

    pub fn provide_context(mut self, provider: impl Into<String>) -> Self {
        self.draft().context_provider = Some(provider.into());
        self
    }

    pub fn handle(mut self, handler: impl Into<String>) -> Self {
        self.draft().handler = Some(handler.into());
        self
    }

    pub fn store_state_in(mut self, collection: impl Into<String>) -> Self {
        self.draft().state_collection = Some(collection.into());
        self
    }

    pub fn store_events_in(mut self, stream: impl Into<String>) -> Self {
        self.draft().event_stream = Some(stream.into());
        self
    }

    pub fn record_that(mut self, event: impl Into<String>) -> EventBuilder<'a> {
        self.draft().events.push((event.into(), None));
        EventBuilder { process: self }
    }

    pub fn and_record_that(self, event: impl Into<String>) -> EventBuilder<'a> {
        self.record_that(event)
    }

    /// Declares an alternative outcome. Alternatives are not exclusive: every declared event is
    /// accepted on its own.
    pub fn or_record_that(self, event: impl Into<String>) -> EventBuilder<'a> {
        self.record_that(event)
    }
}

pub struct EventBuilder<'a> {
    process: ProcessBuilder<'a>,
}

impl<'a> EventBuilder<'a> {
    pub fn apply(mut self, apply: impl Into<String>) -> ProcessBuilder<'a> {
        if let Some(last) = self.process.draft().events.last_mut() {
            last.1 = Some(apply.into());
        }
        self.process
    }
}

pub struct ProjectionBuilder<'a> {
    registry: &'a mut Registry,
    index: usize,
}

impl ProjectionBuilder<'_> {
    pub fn with(self, name: impl Into<String>, projector: impl Into<String>) -> Self {
        let draft = &mut self.registry.projections[self.index];
        draft.name = Some(name.into());
        draft.projector = Some(projector.into());
        self
    }

    pub fn filter_events<I, N>(self, events: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.registry.projections[self.index].event_filter =
            Some(events.into_iter().map(Into::into).collect());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::DEFAULT_STREAM;
    use serde_json::json;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_command("AddBuilding", json!({}))
            .register_command("CheckInUser", json!({}))
            .register_event("BuildingAdded", json!({}))
            .register_event("UserCheckedIn", json!({}))
            .register_event("DoubleCheckInDetected", json!({}));
        registry
    }

    fn describe_building(registry: &mut Registry) {
        registry
            .process("AddBuilding")
            .with_new("Building")
            .identified_by("buildingId")
            .handle("add")
            .record_that("BuildingAdded")
            .apply("whenBuildingAdded");
        registry
            .process("CheckInUser")
            .with_existing("Building")
            .handle("checkIn")
            .record_that("UserCheckedIn")
            .apply("whenUserCheckedIn")
            .or_record_that("DoubleCheckInDetected")
            .apply("whenDoubleCheckInDetected");
    }

    #[test]
    fn compiles_commands_and_aggregates() {
        let mut registry = registry();
        describe_building(&mut registry);
        let compiled = registry.compile().unwrap();

        let check_in = compiled.command("CheckInUser").unwrap();
        assert!(!check_in.is_new);
        // identifier inherited from AddBuilding
        assert_eq!(check_in.identifier, "buildingId");
        assert_eq!(
            check_in.apply_for("DoubleCheckInDetected"),
            Some("whenDoubleCheckInDetected")
        );

        let building = compiled.aggregate("Building").unwrap();
        assert_eq!(building.event_apply_map.len(), 3);
        assert_eq!(building.stream(DEFAULT_STREAM), DEFAULT_STREAM);
    }

    #[test]
    fn identifier_defaults_to_id() {
        let mut registry = registry();
        registry
            .process("AddBuilding")
            .with_new("Building")
            .handle("add")
            .record_that("BuildingAdded")
            .apply("whenBuildingAdded");
        let compiled = registry.compile().unwrap();
        assert_eq!(compiled.command("AddBuilding").unwrap().identifier, "id");
    }

    #[test]
    fn rejects_two_processes_for_one_command() {
        let mut registry = registry();
        describe_building(&mut registry);
        registry
            .process("AddBuilding")
            .with_new("Other")
            .handle("other")
            .record_that("BuildingAdded")
            .apply("whenOther");
        let err = registry.compile().unwrap_err();
        assert!(matches!(err, EngineError::DuplicateHandler { command } if command == "AddBuilding"));
    }

    #[test]
    fn rejects_process_and_controller_for_one_command() {
        let mut registry = registry();
        describe_building(&mut registry);
        registry.pass("AddBuilding", "mailer");
        let err = registry.compile().unwrap_err();
        assert!(matches!(err, EngineError::DuplicateHandler { .. }));
    }

    #[test]
    fn recorded_events_need_an_apply_function() {
        let mut registry = registry();
        let _ = registry
            .process("AddBuilding")
            .with_new("Building")
            .handle("add")
            .record_that("BuildingAdded");
        let err = registry.compile().unwrap_err();
        assert!(matches!(err, EngineError::UnmappedEvent { .. }));
    }

    #[test]
    fn unregistered_messages_are_rejected() {
        let mut registry = registry();
        registry
            .process("RemoveBuilding")
            .with_existing("Building")
            .handle("remove");
        assert!(registry.compile().is_err());

        let mut registry = self::registry();
        registry.on("Unknown", "listener");
        assert!(registry.compile().is_err());
    }

    #[test]
    fn conflicting_identifiers_are_rejected() {
        let mut registry = registry();
        describe_building(&mut registry);
        registry.processes[1].identifier = Some("id".to_string());
        assert!(registry.compile().is_err());
    }

    #[test]
    fn overrides_apply_to_the_whole_aggregate() {
        let mut registry = registry();
        registry
            .process("AddBuilding")
            .with_new("Building")
            .identified_by("buildingId")
            .store_state_in("buildings")
            .store_events_in("building_stream")
            .handle("add")
            .record_that("BuildingAdded")
            .apply("whenBuildingAdded");
        registry
            .process("CheckInUser")
            .with_existing("Building")
            .handle("checkIn")
            .record_that("UserCheckedIn")
            .apply("whenUserCheckedIn");
        let compiled = registry.compile().unwrap();

        let check_in = compiled.command("CheckInUser").unwrap();
        assert_eq!(check_in.state_collection.as_deref(), Some("buildings"));
        assert_eq!(check_in.event_stream.as_deref(), Some("building_stream"));
        assert_eq!(compiled.aggregate("Building").unwrap().collection(), "buildings");
    }

    #[test]
    fn compiles_queries_listeners_and_projections() {
        let mut registry = registry();
        describe_building(&mut registry);
        registry
            .register_query("Building", Some(json!({})))
            .resolve_with("BuildingResolver");
        registry.on("UserCheckedIn", "notifySecurity");
        registry
            .watch(DEFAULT_STREAM)
            .with("building_details", "BuildingProjector")
            .filter_events(["BuildingAdded", "UserCheckedIn"]);
        let compiled = registry.compile().unwrap();

        assert_eq!(compiled.query("Building").unwrap().resolver, "BuildingResolver");
        assert_eq!(compiled.listeners_of("UserCheckedIn"), ["notifySecurity".to_string()]);
        assert!(compiled.listeners_of("BuildingAdded").is_empty());
        let projection = compiled.projection("building_details").unwrap();
        assert!(projection.accepts("BuildingAdded"));
        assert!(!projection.accepts("DoubleCheckInDetected"));
    }

    #[test]
    fn queries_need_a_resolver() {
        let mut registry = registry();
        let _ = registry.register_query("Buildings", None);
        assert!(registry.compile().is_err());
    }

    #[test]
    fn compiled_descriptions_survive_the_cache() {
        let mut registry = registry();
        describe_building(&mut registry);
        let compiled = registry.compile().unwrap();
        let cached = compiled.to_cache().unwrap();
        assert_eq!(CompiledDescriptions::from_cache(&cached).unwrap(), compiled);
    }
}
