use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::{
    EngineError, Message, Payload, Result,
    flavour::{
        DecoratedEvent, DomainMessage, DomainState, DomainValue, downcast_box, downcast_ref,
        identifier_value,
    },
};

/// The `TypedMessage` trait is implemented by commands and events of the typed flavours.
///
/// A message type is either a plain struct travelling under a single name, or an enum whose
/// variants travel under their own names. Enums must use adjacently tagged serialization
/// (`#[serde(tag = "type", content = "data")]`) so that the name can be rebuilt from the envelope.
pub trait TypedMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name the message travels under.
    fn message_name(&self) -> String;

    /// Reads the aggregate identifier. `None` means the message has no such field.
    fn aggregate_id(&self, field: &str) -> Option<String> {
        let value = serde_json::to_value(self).ok()?;
        identifier_value(value.get(field)).or_else(|| {
            value
                .get("data")
                .and_then(|data| identifier_value(data.get(field)))
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    Plain,
    Tagged,
}

type Decoder = Arc<dyn Fn(&Message) -> Result<DomainMessage> + Send + Sync>;

#[derive(Clone)]
struct Encoder {
    encode: Arc<dyn Fn(&DomainValue) -> Result<(String, Payload)> + Send + Sync>,
    identify: Arc<dyn Fn(&DomainValue, &str) -> Option<String> + Send + Sync>,
}

#[derive(Clone)]
struct StateCodec {
    encode: Arc<dyn Fn(&DomainValue) -> Result<Value> + Send + Sync>,
    decode: Arc<dyn Fn(Value) -> Result<DomainState> + Send + Sync>,
}

/// Maps envelope names to typed messages and back, and aggregate types to their state types.
#[derive(Clone, Default)]
pub struct TypedCodec {
    decoders: HashMap<String, Decoder>,
    encoders: HashMap<TypeId, Encoder>,
    states: HashMap<String, StateCodec>,
}

impl TypedCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a struct message travelling under `name`.
    pub fn message<T: TypedMessage>(&mut self, name: impl Into<String>) {
        self.register::<T>(vec![name.into()], Shape::Plain);
    }

    /// Registers an adjacently tagged enum whose variants travel under `names`.
    pub fn tagged<T, I, N>(&mut self, names: I)
    where
        T: TypedMessage,
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.register::<T>(names.into_iter().map(Into::into).collect(), Shape::Tagged);
    }

    pub fn state<S>(&mut self, aggregate_type: impl Into<String>)
    where
        S: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let aggregate_type = aggregate_type.into();
        let ty = aggregate_type.clone();
        let codec = StateCodec {
            encode: Arc::new(move |state: &DomainValue| {
                let state = downcast_ref::<S>(state, "aggregate state")?;
                serde_json::to_value(state).map_err(|source| EngineError::MalformedPayload {
                    name: ty.clone(),
                    source,
                })
            }),
            decode: {
                let ty = aggregate_type.clone();
                Arc::new(move |value: Value| {
                    let state: S = serde_json::from_value(value).map_err(|source| {
                        EngineError::MalformedPayload {
                            name: ty.clone(),
                            source,
                        }
                    })?;
                    Ok(Box::new(state) as DomainState)
                })
            },
        };
        self.states.insert(aggregate_type, codec);
    }

    fn register<T: TypedMessage>(&mut self, names: Vec<String>, shape: Shape) {
        for name in names {
            let decoder: Decoder = Arc::new(move |message: &Message| {
                let value = match shape {
                    Shape::Plain => Value::Object(message.payload().clone()),
                    Shape::Tagged if message.payload().is_empty() => {
                        json!({ "type": message.name() })
                    }
                    Shape::Tagged => json!({ "type": message.name(), "data": message.payload() }),
                };
                let typed: T = serde_json::from_value(value).map_err(|source| {
                    EngineError::MalformedPayload {
                        name: message.name().to_string(),
                        source,
                    }
                })?;
                Ok(Box::new(typed) as DomainMessage)
            });
            self.decoders.insert(name, decoder);
        }

        let encoder = Encoder {
            encode: Arc::new(move |value: &DomainValue| {
                let typed = downcast_ref::<T>(value, "message")?;
                let name = typed.message_name();
                let value = serde_json::to_value(typed).map_err(|source| {
                    EngineError::MalformedPayload {
                        name: name.clone(),
                        source,
                    }
                })?;
                let payload = match (shape, value) {
                    (Shape::Plain, Value::Object(map)) => map,
                    (Shape::Tagged, Value::Object(mut map)) => match map.remove("data") {
                        Some(Value::Object(data)) => data,
                        Some(Value::Null) | None => Payload::new(),
                        Some(other) => {
                            return Err(EngineError::InvalidMessage(format!(
                                "payload of '{name}' must be an object, got {other}"
                            )));
                        }
                    },
                    (_, other) => {
                        return Err(EngineError::InvalidMessage(format!(
                            "payload of '{name}' must be an object, got {other}"
                        )));
                    }
                };
                Ok((name, payload))
            }),
            identify: Arc::new(|value: &DomainValue, field: &str| {
                value
                    .downcast_ref::<T>()
                    .and_then(|typed| typed.aggregate_id(field))
            }),
        };
        self.encoders.insert(TypeId::of::<T>(), encoder);
    }

    pub fn knows_message(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    pub fn decode(&self, message: &Message) -> Result<DomainMessage> {
        let decoder = self
            .decoders
            .get(message.name())
            .ok_or_else(|| EngineError::UnrecognizedMessage {
                name: message.name().to_string(),
            })?;
        decoder(message)
    }

    /// Returns the envelope name and payload of a typed message.
    pub fn encode(&self, value: &DomainValue) -> Result<(String, Payload)> {
        let encoder = self.encoder_for(value)?;
        (encoder.encode)(value)
    }

    pub fn identify(&self, value: &DomainValue, field: &str) -> Result<Option<String>> {
        let encoder = self.encoder_for(value)?;
        Ok((encoder.identify)(value, field))
    }

    pub fn payload(&self, value: &DomainValue) -> Result<Payload> {
        Ok(self.encode(value)?.1)
    }

    /// Wraps a typed event yielded by a handler in its envelope.
    pub fn decorate_event(&self, event: DomainMessage) -> Result<DecoratedEvent> {
        let (name, payload) = self.encode(event.as_ref())?;
        Ok(DecoratedEvent::new(Message::event(name, payload), event))
    }

    /// Reads the aggregate identifier of a typed command, failing when the field is missing.
    pub fn aggregate_id(&self, command: &DomainValue, identifier: &str) -> Result<String> {
        match self.identify(command, identifier)? {
            Some(id) => Ok(id),
            None => {
                let (name, _) = self.encode(command)?;
                Err(EngineError::MissingAggregateIdentifier {
                    command: name,
                    field: identifier.to_string(),
                })
            }
        }
    }

    pub fn encode_state(&self, aggregate_type: &str, state: &DomainValue) -> Result<Value> {
        let codec = self.state_codec(aggregate_type)?;
        (codec.encode)(state)
    }

    pub fn decode_state(&self, aggregate_type: &str, state: Value) -> Result<DomainState> {
        let codec = self.state_codec(aggregate_type)?;
        (codec.decode)(state)
    }

    /// Decodes an envelope straight into `T`, for callers that know the concrete type.
    pub fn decode_as<T: Any>(&self, message: &Message) -> Result<T> {
        let decoded = self.decode(message)?;
        Ok(*downcast_box::<T>(decoded, "message")?)
    }

    fn encoder_for(&self, value: &DomainValue) -> Result<&Encoder> {
        self.encoders.get(&value.type_id()).ok_or_else(|| {
            EngineError::InvalidDescription(
                "typed message was never registered with the flavour".to_string(),
            )
        })
    }

    fn state_codec(&self, aggregate_type: &str) -> Result<&StateCodec> {
        self.states.get(aggregate_type).ok_or_else(|| {
            EngineError::InvalidDescription(format!(
                "no state type registered for aggregate '{aggregate_type}'"
            ))
        })
    }
}
