use std::{collections::HashMap, sync::Arc};

use serde_json::Value;

use crate::{
    EngineError, Message, MessageKind, Payload, Rejection, Result,
    flavour::{
        ApplyCall, Context, DecoratedEvent, Decide, DomainMessage, DomainState, DomainValue,
        Flavour, FunctionKind, HandlerCall, YieldedEvents, downcast_box, downcast_ref,
        identifier_value,
    },
};

type Handler = Arc<dyn Fn(Decide<'_, Value, Message>) -> Result<Vec<Message>, Rejection> + Send + Sync>;
type Apply = Arc<dyn Fn(Option<Value>, &Message) -> Value + Send + Sync>;

/// Flavour where domain messages are the envelopes themselves and state is plain JSON.
///
/// Nothing is translated, which makes it the quickest way to prototype a model: handlers receive
/// the command [`Message`] and return event messages built with [`Message::event`].
#[derive(Clone, Default)]
pub struct PassThroughFlavour {
    handlers: HashMap<String, Handler>,
    applies: HashMap<String, Apply>,
}

impl PassThroughFlavour {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler<F>(mut self, reference: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Decide<'_, Value, Message>) -> Result<Vec<Message>, Rejection> + Send + Sync + 'static,
    {
        self.handlers.insert(reference.into(), Arc::new(handler));
        self
    }

    pub fn apply<F>(mut self, reference: impl Into<String>, apply: F) -> Self
    where
        F: Fn(Option<Value>, &Message) -> Value + Send + Sync + 'static,
    {
        self.applies.insert(reference.into(), Arc::new(apply));
        self
    }
}

impl Flavour for PassThroughFlavour {
    fn name(&self) -> &'static str {
        "pass-through"
    }

    fn knows_function(&self, kind: FunctionKind, reference: &str) -> bool {
        match kind {
            FunctionKind::Handler => self.handlers.contains_key(reference),
            FunctionKind::Apply => self.applies.contains_key(reference),
        }
    }

    fn deserialize(&self, message: &Message) -> Result<DomainMessage> {
        Ok(Box::new(message.clone()))
    }

    fn serialize_payload(&self, message: &DomainValue) -> Result<Payload> {
        Ok(downcast_ref::<Message>(message, "message")?.payload().clone())
    }

    fn decorate_event(&self, event: DomainMessage) -> Result<DecoratedEvent> {
        let event = downcast_box::<Message>(event, "event")?;
        if event.kind() != MessageKind::Event {
            return Err(EngineError::InvalidMessage(format!(
                "handler yielded {} '{}' instead of an event",
                event.kind(),
                event.name()
            )));
        }
        Ok(DecoratedEvent::new((*event).clone(), event))
    }

    fn extract_aggregate_id(&self, identifier: &str, command: &DomainValue) -> Result<String> {
        let command = downcast_ref::<Message>(command, "command")?;
        identifier_value(command.get(identifier)).ok_or_else(|| {
            EngineError::MissingAggregateIdentifier {
                command: command.name().to_string(),
                field: identifier.to_string(),
            }
        })
    }

    fn invoke_handler(&self, call: HandlerCall<'_>) -> Result<YieldedEvents> {
        let handler = self
            .handlers
            .get(call.handler)
            .ok_or_else(|| EngineError::UnknownFunction {
                kind: "handler",
                reference: call.handler.to_string(),
            })?;
        let state = match call.state {
            Some(state) => Some(downcast_ref::<Value>(state, "state")?),
            None => None,
        };
        let command = downcast_ref::<Message>(call.command, "command")?;

        let events = handler(Decide {
            state,
            command,
            context: Context::new(call.context),
        })
        .map_err(|rejection| call.reject(rejection))?;

        Ok(Box::new(
            events.into_iter().map(|event| Box::new(event) as DomainMessage),
        ))
    }

    fn invoke_apply(
        &self,
        call: ApplyCall<'_>,
        state: Option<DomainState>,
        event: &DomainValue,
    ) -> Result<DomainState> {
        let apply = self
            .applies
            .get(call.apply)
            .ok_or_else(|| EngineError::UnknownFunction {
                kind: "apply",
                reference: call.apply.to_string(),
            })?;
        let state = match state {
            Some(state) => Some(*downcast_box::<Value>(state, "state")?),
            None => None,
        };
        let event = downcast_ref::<Message>(event, "event")?;
        Ok(Box::new(apply(state, event)))
    }

    fn serialize_state(&self, _aggregate_type: &str, state: &DomainValue) -> Result<Value> {
        Ok(downcast_ref::<Value>(state, "state")?.clone())
    }

    fn deserialize_state(&self, _aggregate_type: &str, state: Value) -> Result<DomainState> {
        Ok(Box::new(state))
    }
}
