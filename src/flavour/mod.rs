use std::{
    any::{Any, type_name},
    collections::HashMap,
    sync::Arc,
};

use serde_json::Value;

use crate::{EngineError, Message, Payload, Rejection, Result};

pub mod codec;
pub mod functional;
pub mod object;
pub mod pass_through;

pub use codec::{TypedCodec, TypedMessage};
pub use functional::FunctionalFlavour;
pub use object::{EventSourced, ObjectFlavour, Recorder};
pub use pass_through::PassThroughFlavour;

/// Type-erased domain value (command, event, context or state) crossing the flavour boundary.
pub type DomainValue = dyn Any + Send + Sync;

/// Owned domain command or event.
pub type DomainMessage = Box<DomainValue>;

/// Owned domain state of an aggregate.
pub type DomainState = Box<DomainValue>;

/// Events produced by a handler. The runtime drains the iterator before applying anything.
pub type YieldedEvents = Box<dyn Iterator<Item = DomainMessage> + Send>;

type ErasedHandler = Arc<dyn Fn(&HandlerCall<'_>) -> Result<YieldedEvents> + Send + Sync>;

/// Type-erased handlers of the typed flavours, by reference.
#[derive(Clone, Default)]
pub(crate) struct HandlerTable(HashMap<String, ErasedHandler>);

impl HandlerTable {
    pub(crate) fn insert<F>(&mut self, reference: impl Into<String>, handler: F)
    where
        F: Fn(&HandlerCall<'_>) -> Result<YieldedEvents> + Send + Sync + 'static,
    {
        self.0.insert(reference.into(), Arc::new(handler));
    }

    pub(crate) fn contains(&self, reference: &str) -> bool {
        self.0.contains_key(reference)
    }

    pub(crate) fn invoke(&self, call: HandlerCall<'_>) -> Result<YieldedEvents> {
        let handler = self
            .0
            .get(call.handler)
            .ok_or_else(|| EngineError::UnknownFunction {
                kind: "handler",
                reference: call.handler.to_string(),
            })?;
        handler(&call)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionKind {
    Handler,
    Apply,
}

impl FunctionKind {
    pub fn label(&self) -> &'static str {
        match self {
            FunctionKind::Handler => "handler",
            FunctionKind::Apply => "apply",
        }
    }
}

/// Read-only context handed to a handler, as returned by the command's context provider.
#[derive(Clone, Copy)]
pub struct Context<'a>(Option<&'a DomainValue>);

impl<'a> Context<'a> {
    pub fn new(value: Option<&'a DomainValue>) -> Self {
        Self(value)
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_present(&self) -> bool {
        self.0.is_some()
    }

    /// Returns the context if one was provided and it has type `X`.
    pub fn get<X: Any>(&self) -> Option<&'a X> {
        self.0.and_then(|value| value.downcast_ref::<X>())
    }
}

/// Typed input of a decision function.
pub struct Decide<'a, S, C> {
    /// Current state, `None` for a command creating the aggregate.
    pub state: Option<&'a S>,
    pub command: &'a C,
    pub context: Context<'a>,
}

/// Everything the runtime knows when it asks a flavour to run a handler.
pub struct HandlerCall<'a> {
    pub aggregate_type: &'a str,
    pub aggregate_id: &'a str,
    pub command_name: &'a str,
    pub handler: &'a str,
    pub state: Option<&'a DomainValue>,
    pub command: &'a DomainValue,
    pub context: Option<&'a DomainValue>,
}

impl HandlerCall<'_> {
    /// Turns a domain refusal into an error carrying the aggregate and command.
    pub fn reject(&self, rejection: Rejection) -> EngineError {
        EngineError::DomainRejection {
            aggregate_type: self.aggregate_type.to_string(),
            aggregate_id: self.aggregate_id.to_string(),
            command: self.command_name.to_string(),
            reason: rejection.reason,
        }
    }
}

pub struct ApplyCall<'a> {
    pub aggregate_type: &'a str,
    pub event_name: &'a str,
    pub apply: &'a str,
}

/// An event translated to the uniform envelope while keeping the original domain event.
pub struct DecoratedEvent {
    message: Message,
    event: DomainMessage,
}

impl DecoratedEvent {
    pub fn new(message: Message, event: DomainMessage) -> Self {
        Self { message, event }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn name(&self) -> &str {
        self.message.name()
    }

    pub fn event(&self) -> &DomainValue {
        self.event.as_ref()
    }

    pub fn with_added_metadata(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            message: self.message.with_added_metadata(key, value),
            event: self.event,
        }
    }

    pub fn into_parts(self) -> (Message, DomainMessage) {
        (self.message, self.event)
    }
}

/// The `Flavour` trait is the port between the uniform envelopes handled by the engine and the
/// representation used by business logic.
///
/// The runtime only ever talks to `dyn Flavour`; the three implementations shipped with the crate
/// ([`PassThroughFlavour`], [`FunctionalFlavour`], [`ObjectFlavour`]) are picked once when the
/// engine is built. Handler and apply functions are referenced by name in the compiled
/// descriptions and resolved by the flavour at call time.
pub trait Flavour: Send + Sync {
    fn name(&self) -> &'static str;

    /// Used when the engine is built to reject descriptions pointing at unregistered functions.
    fn knows_function(&self, kind: FunctionKind, reference: &str) -> bool;

    fn deserialize(&self, message: &Message) -> Result<DomainMessage>;

    fn serialize_payload(&self, message: &DomainValue) -> Result<Payload>;

    fn decorate_event(&self, event: DomainMessage) -> Result<DecoratedEvent>;

    fn extract_aggregate_id(&self, identifier: &str, command: &DomainValue) -> Result<String>;

    fn invoke_handler(&self, call: HandlerCall<'_>) -> Result<YieldedEvents>;

    fn invoke_apply(
        &self,
        call: ApplyCall<'_>,
        state: Option<DomainState>,
        event: &DomainValue,
    ) -> Result<DomainState>;

    fn serialize_state(&self, aggregate_type: &str, state: &DomainValue) -> Result<Value>;

    fn deserialize_state(&self, aggregate_type: &str, state: Value) -> Result<DomainState>;
}

pub(crate) fn downcast_ref<'a, T: Any>(value: &'a DomainValue, role: &str) -> Result<&'a T> {
    value.downcast_ref::<T>().ok_or_else(|| {
        EngineError::InvalidDescription(format!(
            "expected {} to be of type {}",
            role,
            type_name::<T>()
        ))
    })
}

pub(crate) fn downcast_box<T: Any>(value: Box<DomainValue>, role: &str) -> Result<Box<T>> {
    value.downcast::<T>().map_err(|_| {
        EngineError::InvalidDescription(format!(
            "expected {} to be of type {}",
            role,
            type_name::<T>()
        ))
    })
}

/// Reads an identifier out of a JSON value; strings are taken as is, numbers are stringified.
pub(crate) fn identifier_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
