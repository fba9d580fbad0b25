use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EngineError, Result};

pub mod builder;

pub use builder::{EventBuilder, ProcessBuilder, ProjectionBuilder, QueryBuilder, Registry};

/// Identifier field assumed when no `identified_by` was given for an aggregate type.
pub const DEFAULT_IDENTIFIER: &str = "id";

/// Name of the shared write-model stream.
pub const DEFAULT_STREAM: &str = "event_stream";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventApply {
    pub event: String,
    pub apply: String,
}

/// Routing of one command to an aggregate lifecycle handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandDescription {
    pub command_name: String,
    pub aggregate_type: String,
    pub is_new: bool,
    pub identifier: String,
    pub context_provider: Option<String>,
    pub handler: String,
    /// Events the handler may yield, in declaration order.
    pub event_apply_map: Vec<EventApply>,
    pub state_collection: Option<String>,
    pub event_stream: Option<String>,
}

impl CommandDescription {
    pub fn apply_for(&self, event: &str) -> Option<&str> {
        self.event_apply_map
            .iter()
            .find(|entry| entry.event == event)
            .map(|entry| entry.apply.as_str())
    }
}

/// Everything known about one aggregate type, merged from all the commands addressing it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateDescription {
    pub aggregate_type: String,
    pub identifier: String,
    pub event_apply_map: Vec<EventApply>,
    pub state_collection: Option<String>,
    pub event_stream: Option<String>,
}

impl AggregateDescription {
    pub fn apply_for(&self, event: &str) -> Option<&str> {
        self.event_apply_map
            .iter()
            .find(|entry| entry.event == event)
            .map(|entry| entry.apply.as_str())
    }

    pub fn stream<'a>(&'a self, default_stream: &'a str) -> &'a str {
        self.event_stream.as_deref().unwrap_or(default_stream)
    }

    /// Collection holding snapshots of this aggregate type.
    pub fn collection(&self) -> String {
        self.state_collection
            .clone()
            .unwrap_or_else(|| format!("{}_state", self.aggregate_type.to_lowercase()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryDescription {
    pub name: String,
    pub schema: Option<Value>,
    pub resolver: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectionDescription {
    pub name: String,
    pub stream: String,
    pub projector: String,
    /// `None` lets every event of the stream through.
    pub event_filter: Option<Vec<String>>,
}

impl ProjectionDescription {
    pub fn accepts(&self, event: &str) -> bool {
        match &self.event_filter {
            Some(filter) => filter.iter().any(|name| name == event),
            None => true,
        }
    }
}

/// Immutable routing tables produced by [`Registry::compile`].
///
/// The compiled form only references functions by name, so it can be cached with
/// [`to_cache`](CompiledDescriptions::to_cache) and reloaded at startup with
/// [`from_cache`](CompiledDescriptions::from_cache) without running registrations again.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledDescriptions {
    pub commands: BTreeMap<String, CommandDescription>,
    pub controllers: BTreeMap<String, String>,
    pub aggregates: BTreeMap<String, AggregateDescription>,
    pub command_schemas: BTreeMap<String, Value>,
    pub event_schemas: BTreeMap<String, Value>,
    pub queries: BTreeMap<String, QueryDescription>,
    pub listeners: BTreeMap<String, Vec<String>>,
    pub projections: Vec<ProjectionDescription>,
}

impl CompiledDescriptions {
    pub fn command(&self, name: &str) -> Option<&CommandDescription> {
        self.commands.get(name)
    }

    pub fn controller(&self, command: &str) -> Option<&str> {
        self.controllers.get(command).map(String::as_str)
    }

    pub fn aggregate(&self, aggregate_type: &str) -> Result<&AggregateDescription> {
        self.aggregates.get(aggregate_type).ok_or_else(|| {
            EngineError::InvalidDescription(format!("unknown aggregate type '{aggregate_type}'"))
        })
    }

    pub fn query(&self, name: &str) -> Option<&QueryDescription> {
        self.queries.get(name)
    }

    pub fn listeners_of(&self, event: &str) -> &[String] {
        self.listeners.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn projection(&self, name: &str) -> Option<&ProjectionDescription> {
        self.projections.iter().find(|p| p.name == name)
    }

    pub fn to_cache(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|source| EngineError::MalformedPayload {
            name: "compiled descriptions".to_string(),
            source,
        })
    }

    pub fn from_cache(cached: &str) -> Result<Self> {
        serde_json::from_str(cached).map_err(|source| EngineError::MalformedPayload {
            name: "compiled descriptions".to_string(),
            source,
        })
    }
}
