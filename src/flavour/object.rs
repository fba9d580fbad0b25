use std::{collections::HashMap, mem, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    EngineError, Message, Payload, Rejection, Result,
    flavour::{
        ApplyCall, Context, DecoratedEvent, DomainMessage, DomainState, DomainValue,
        Flavour, FunctionKind, HandlerCall, HandlerTable, TypedCodec, TypedMessage,
        YieldedEvents, downcast_box, downcast_ref,
    },
};

/// An aggregate whose state and behaviour live on the same type.
///
/// `apply` must be a pure transition: it receives the current value and one event and returns the
/// next value. The same function is used while recording new events and while replaying history,
/// so both paths always produce the same state.
pub trait EventSourced: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Event: TypedMessage + Clone;

    fn apply(self, event: &Self::Event) -> Self;
}

/// An aggregate value together with the events recorded since it was loaded.
///
/// Handlers take a `Recorder` by value and hand it back, so the pending buffer is never shared.
#[derive(Clone, Default)]
pub struct Recorder<A: EventSourced> {
    state: A,
    recorded: Vec<A::Event>,
}

impl<A: EventSourced> Recorder<A> {
    pub fn new() -> Self {
        Self::from_state(A::default())
    }

    pub fn from_state(state: A) -> Self {
        Self {
            state,
            recorded: Vec::new(),
        }
    }

    /// Applies `event` and keeps it to be handed over to the engine.
    pub fn record_that(mut self, event: A::Event) -> Self {
        self.state = self.state.apply(&event);
        self.recorded.push(event);
        self
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn pending(&self) -> &[A::Event] {
        &self.recorded
    }

    pub fn pop_recorded_events(&mut self) -> Vec<A::Event> {
        mem::take(&mut self.recorded)
    }

    pub fn into_state(self) -> A {
        self.state
    }
}

type Transition = Arc<dyn Fn(Option<DomainState>, &DomainValue) -> Result<DomainState> + Send + Sync>;

/// Flavour for aggregates modelled as [`EventSourced`] values.
///
/// Handlers receive a [`Recorder`] (a fresh one for commands creating the aggregate) and record
/// events on it. Apply references in the descriptions are not looked up: every event is folded
/// with the aggregate's own [`EventSourced::apply`].
#[derive(Clone, Default)]
pub struct ObjectFlavour {
    codec: TypedCodec,
    handlers: HandlerTable,
    transitions: HashMap<String, Transition>,
}

impl ObjectFlavour {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn codec(&self) -> &TypedCodec {
        &self.codec
    }

    /// Registers an aggregate type along with its state codec and transition function.
    pub fn aggregate<A: EventSourced>(mut self, aggregate_type: impl Into<String>) -> Self {
        let aggregate_type = aggregate_type.into();
        self.codec.state::<A>(aggregate_type.clone());
        let transition: Transition =
            Arc::new(|state: Option<DomainState>, event: &DomainValue| {
                let state = match state {
                    Some(state) => *downcast_box::<A>(state, "aggregate")?,
                    None => A::default(),
                };
                let event = downcast_ref::<A::Event>(event, "event")?;
                Ok(Box::new(state.apply(event)) as DomainState)
            });
        self.transitions.insert(aggregate_type, transition);
        self
    }

    pub fn command<C: TypedMessage>(mut self, name: impl Into<String>) -> Self {
        self.codec.message::<C>(name);
        self
    }

    pub fn event<E: TypedMessage>(mut self, name: impl Into<String>) -> Self {
        self.codec.message::<E>(name);
        self
    }

    pub fn tagged_events<E, I, N>(mut self, names: I) -> Self
    where
        E: TypedMessage,
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.codec.tagged::<E, I, N>(names);
        self
    }

    /// Registers a method-like handler. Commands creating the aggregate receive a fresh recorder.
    pub fn handler<A, C, F>(mut self, reference: impl Into<String>, handler: F) -> Self
    where
        A: EventSourced,
        C: Send + Sync + 'static,
        F: Fn(Recorder<A>, &C, Context<'_>) -> Result<Recorder<A>, Rejection>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(reference, move |call: &HandlerCall<'_>| {
            let recorder = match call.state {
                Some(state) => Recorder::from_state(downcast_ref::<A>(state, "aggregate")?.clone()),
                None => Recorder::new(),
            };
            let command = downcast_ref::<C>(call.command, "command")?;
            let mut recorder = handler(recorder, command, Context::new(call.context))
                .map_err(|rejection| call.reject(rejection))?;
            let events = recorder.pop_recorded_events();
            Ok(Box::new(
                events
                    .into_iter()
                    .map(|event| Box::new(event) as DomainMessage),
            ) as YieldedEvents)
        });
        self
    }

    /// Rebuilds an aggregate by replaying recorded envelopes in order.
    pub fn reconstitute<A, I>(&self, history: I) -> Result<Recorder<A>>
    where
        A: EventSourced,
        I: IntoIterator<Item = Message>,
    {
        let mut state = A::default();
        for message in history {
            let event: A::Event = self.codec.decode_as(&message)?;
            state = state.apply(&event);
        }
        Ok(Recorder::from_state(state))
    }

    pub fn reconstitute_from_snapshot<A: EventSourced>(&self, state: Value) -> Result<Recorder<A>> {
        let state: A = serde_json::from_value(state).map_err(|source| {
            EngineError::MalformedPayload {
                name: std::any::type_name::<A>().to_string(),
                source,
            }
        })?;
        Ok(Recorder::from_state(state))
    }
}

impl Flavour for ObjectFlavour {
    fn name(&self) -> &'static str {
        "object"
    }

    fn knows_function(&self, kind: FunctionKind, reference: &str) -> bool {
        match kind {
            FunctionKind::Handler => self.handlers.contains(reference),
            // Events are always folded with the aggregate's own transition.
            FunctionKind::Apply => true,
        }
    }

    fn deserialize(&self, message: &Message) -> Result<DomainMessage> {
        self.codec.decode(message)
    }

    fn serialize_payload(&self, message: &DomainValue) -> Result<Payload> {
        self.codec.payload(message)
    }

    fn decorate_event(&self, event: DomainMessage) -> Result<DecoratedEvent> {
        self.codec.decorate_event(event)
    }

    fn extract_aggregate_id(&self, identifier: &str, command: &DomainValue) -> Result<String> {
        self.codec.aggregate_id(command, identifier)
    }

    fn invoke_handler(&self, call: HandlerCall<'_>) -> Result<YieldedEvents> {
        self.handlers.invoke(call)
    }

    fn invoke_apply(
        &self,
        call: ApplyCall<'_>,
        state: Option<DomainState>,
        event: &DomainValue,
    ) -> Result<DomainState> {
        let transition = self.transitions.get(call.aggregate_type).ok_or_else(|| {
            EngineError::InvalidDescription(format!(
                "aggregate '{}' was never registered with the object flavour",
                call.aggregate_type
            ))
        })?;
        transition(state, event)
    }

    fn serialize_state(&self, aggregate_type: &str, state: &DomainValue) -> Result<Value> {
        self.codec.encode_state(aggregate_type, state)
    }

    fn deserialize_state(&self, aggregate_type: &str, state: Value) -> Result<DomainState> {
        self.codec.decode_state(aggregate_type, state)
    }
}
