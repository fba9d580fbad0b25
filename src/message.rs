use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Uuid;

/// Key/value payload of a message.
pub type Payload = Map<String, Value>;

pub const META_AGGREGATE_TYPE: &str = "_aggregate_type";
pub const META_AGGREGATE_ID: &str = "_aggregate_id";
pub const META_AGGREGATE_VERSION: &str = "_aggregate_version";
pub const META_CAUSATION_ID: &str = "_causation_id";
pub const META_CAUSATION_NAME: &str = "_causation_name";
pub const META_CORRELATION_ID: &str = "_correlation_id";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Command,
    Event,
    Query,
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Event => write!(f, "event"),
            MessageKind::Query => write!(f, "query"),
        }
    }
}

/// The `Message` struct is the uniform envelope flowing through the engine.
///
/// Commands, events and queries share the same shape: a name, a kind, a payload and a bag of
/// metadata. Messages are immutable: every `with_*` method returns a new envelope and leaves the
/// original untouched, so an event that has been handed to listeners can never change afterwards.
///
/// Metadata keys starting with an underscore are managed by the engine (aggregate type, id and
/// version, causation and correlation ids).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    name: String,
    kind: MessageKind,
    payload: Payload,
    metadata: Payload,
    created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(kind: MessageKind, name: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            payload,
            metadata: Payload::new(),
            created_at: Utc::now(),
        }
    }

    pub fn command(name: impl Into<String>, payload: Payload) -> Self {
        Self::new(MessageKind::Command, name, payload)
    }

    pub fn event(name: impl Into<String>, payload: Payload) -> Self {
        Self::new(MessageKind::Event, name, payload)
    }

    pub fn query(name: impl Into<String>, payload: Payload) -> Self {
        Self::new(MessageKind::Query, name, payload)
    }

    /// Builds a message from a JSON value, which must be an object (or null for an empty payload).
    pub fn from_value(kind: MessageKind, name: impl Into<String>, payload: Value) -> Option<Self> {
        match payload {
            Value::Object(map) => Some(Self::new(kind, name, map)),
            Value::Null => Some(Self::new(kind, name, Payload::new())),
            _ => None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn metadata(&self) -> &Payload {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    pub fn get_meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Replaces the whole metadata bag.
    pub fn with_metadata(&self, metadata: Payload) -> Self {
        Self {
            metadata,
            ..self.clone()
        }
    }

    pub fn with_added_metadata(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut copy = self.clone();
        copy.metadata.insert(key.into(), value.into());
        copy
    }

    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    pub fn aggregate_type(&self) -> Option<&str> {
        self.metadata.get(META_AGGREGATE_TYPE).and_then(Value::as_str)
    }

    pub fn aggregate_id(&self) -> Option<&str> {
        self.metadata.get(META_AGGREGATE_ID).and_then(Value::as_str)
    }

    pub fn aggregate_version(&self) -> Option<u64> {
        self.metadata.get(META_AGGREGATE_VERSION).and_then(Value::as_u64)
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.metadata.get(META_CAUSATION_ID).and_then(Value::as_str)
    }

    pub fn causation_name(&self) -> Option<&str> {
        self.metadata.get(META_CAUSATION_NAME).and_then(Value::as_str)
    }

    /// Correlation id of the message, falling back to its own id for messages that start a chain.
    pub fn correlation_id(&self) -> String {
        self.metadata
            .get(META_CORRELATION_ID)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Builds a [`Payload`] from a `serde_json::json!` object literal.
///
/// Non-object values produce an empty payload.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}
