use std::{collections::HashMap, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    EngineError, Message, Payload, Rejection, Result,
    flavour::{
        ApplyCall, Context, DecoratedEvent, Decide, DomainMessage, DomainState, DomainValue,
        Flavour, FunctionKind, HandlerCall, HandlerTable, TypedCodec, TypedMessage,
        YieldedEvents, downcast_box, downcast_ref,
    },
};

type Apply = Arc<dyn Fn(Option<DomainState>, &DomainValue) -> Result<DomainState> + Send + Sync>;

/// Flavour for explicit, immutable message types and pure free functions.
///
/// Commands and events are [`TypedMessage`]s registered by name, aggregate state is any
/// serializable type registered per aggregate type. Handlers are `decide` functions receiving the
/// current state and the typed command; applies fold one typed event into the next state.
///
/// ```rust,ignore
/// let flavour = FunctionalFlavour::new()
///     .command::<AddBuilding>("AddBuilding")
///     .tagged_events::<BuildingEvent, _, _>(["BuildingAdded"])
///     .state::<Building>("Building")
///     .handler("Building::add", |d: Decide<'_, Building, AddBuilding>| {
///         Ok(vec![BuildingEvent::BuildingAdded { id: d.command.id.clone() }])
///     })
///     .apply("Building::when_added", |_: Option<Building>, e: &BuildingEvent| Building::from(e));
/// ```
#[derive(Clone, Default)]
pub struct FunctionalFlavour {
    codec: TypedCodec,
    handlers: HandlerTable,
    applies: HashMap<String, Apply>,
}

impl FunctionalFlavour {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn codec(&self) -> &TypedCodec {
        &self.codec
    }

    pub fn command<C: TypedMessage>(mut self, name: impl Into<String>) -> Self {
        self.codec.message::<C>(name);
        self
    }

    pub fn tagged_commands<C, I, N>(mut self, names: I) -> Self
    where
        C: TypedMessage,
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.codec.tagged::<C, I, N>(names);
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

    pub fn state<S>(mut self, aggregate_type: impl Into<String>) -> Self
    where
        S: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.codec.state::<S>(aggregate_type);
        self
    }

    /// Registers a decision function. It may return any finite collection of events, including an
    /// empty one.
    pub fn handler<S, C, E, I, F>(mut self, reference: impl Into<String>, handler: F) -> Self
    where
        S: Send + Sync + 'static,
        C: Send + Sync + 'static,
        E: TypedMessage,
        I: IntoIterator<Item = E>,
        I::IntoIter: Send + 'static,
        F: Fn(Decide<'_, S, C>) -> Result<I, Rejection> + Send + Sync + 'static,
    {
        self.handlers.insert(reference, move |call: &HandlerCall<'_>| {
            let state = match call.state {
                Some(state) => Some(downcast_ref::<S>(state, "state")?),
                None => None,
            };
            let command = downcast_ref::<C>(call.command, "command")?;
            let events = handler(Decide {
                state,
                command,
                context: Context::new(call.context),
            })
            .map_err(|rejection| call.reject(rejection))?;
            Ok(Box::new(
                events
                    .into_iter()
                    .map(|event| Box::new(event) as DomainMessage),
            ) as YieldedEvents)
        });
        self
    }

    /// Registers an apply function. `None` is passed for the first event of a new aggregate.
    pub fn apply<S, E, F>(mut self, reference: impl Into<String>, apply: F) -> Self
    where
        S: Send + Sync + 'static,
        E: Send + Sync + 'static,
        F: Fn(Option<S>, &E) -> S + Send + Sync + 'static,
    {
        let erased: Apply = Arc::new(move |state: Option<DomainState>, event: &DomainValue| {
            let state = match state {
                Some(state) => Some(*downcast_box::<S>(state, "state")?),
                None => None,
            };
            let event = downcast_ref::<E>(event, "event")?;
            Ok(Box::new(apply(state, event)) as DomainState)
        });
        self.applies.insert(reference.into(), erased);
        self
    }
}

impl Flavour for FunctionalFlavour {
    fn name(&self) -> &'static str {
        "functional"
    }

    fn knows_function(&self, kind: FunctionKind, reference: &str) -> bool {
        match kind {
            FunctionKind::Handler => self.handlers.contains(reference),
            FunctionKind::Apply => self.applies.contains_key(reference),
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
        let apply = self
            .applies
            .get(call.apply)
            .ok_or_else(|| EngineError::UnknownFunction {
                kind: "apply",
                reference: call.apply.to_string(),
            })?;
        apply(state, event)
    }

    fn serialize_state(&self, aggregate_type: &str, state: &DomainValue) -> Result<Value> {
        self.codec.encode_state(aggregate_type, state)
    }

    fn deserialize_state(&self, aggregate_type: &str, state: Value) -> Result<DomainState> {
        self.codec.decode_state(aggregate_type, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::payload;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Deposit {
        account: String,
        amount: u64,
    }

    impl TypedMessage for Deposit {
        fn message_name(&self) -> String {
            "Deposit".to_string()
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Deposited {
        account: String,
        amount: u64,
    }

    impl TypedMessage for Deposited {
        fn message_name(&self) -> String {
            "Deposited".to_string()
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Account {
        balance: u64,
    }

    fn flavour() -> FunctionalFlavour {
        FunctionalFlavour::new()
            .command::<Deposit>("Deposit")
            .event::<Deposited>("Deposited")
            .state::<Account>("Account")
            .handler("deposit", |d: Decide<'_, Account, Deposit>| {
                if d.command.amount == 0 {
                    return Err(Rejection::new("nothing to deposit"));
                }
                Ok(vec![Deposited {
                    account: d.command.account.clone(),
                    amount: d.command.amount,
                }])
            })
            .apply("deposited", |state: Option<Account>, e: &Deposited| {
                let mut state = state.unwrap_or_default();
                state.balance += e.amount;
                state
            })
    }

    fn call<'a>(command: &'a DomainValue) -> HandlerCall<'a> {
        HandlerCall {
            aggregate_type: "Account",
            aggregate_id: "A1",
            command_name: "Deposit",
            handler: "deposit",
            state: None,
            command,
            context: None,
        }
    }

    #[test]
    fn handler_yields_typed_events_which_decorate_to_envelopes() {
        let flavour = flavour();
        let cmd = flavour
            .deserialize(&Message::command(
                "Deposit",
                payload(json!({"account": "A1", "amount": 5})),
            ))
            .unwrap_or_else(|_| panic!("deserialize"));
        assert_eq!(
            flavour.extract_aggregate_id("account", cmd.as_ref()).unwrap(),
            "A1"
        );

        let mut events = flavour
            .invoke_handler(call(cmd.as_ref()))
            .unwrap_or_else(|_| panic!("handler"));
        let event = events.next().unwrap();
        assert!(events.next().is_none());

        let decorated = flavour
            .decorate_event(event)
            .unwrap_or_else(|_| panic!("decorate"));
        assert_eq!(decorated.name(), "Deposited");
        assert_eq!(decorated.message().get("amount"), Some(&json!(5)));

        let state = flavour
            .invoke_apply(
                ApplyCall {
                    aggregate_type: "Account",
                    event_name: "Deposited",
                    apply: "deposited",
                },
                None,
                decorated.event(),
            )
            .unwrap_or_else(|_| panic!("apply"));
        assert_eq!(
            flavour.serialize_state("Account", state.as_ref()).unwrap(),
            json!({"balance": 5})
        );
    }

    #[test]
    fn rejections_carry_aggregate_context() {
        let flavour = flavour();
        let cmd: DomainMessage = Box::new(Deposit {
            account: "A1".to_string(),
            amount: 0,
        });
        let err = flavour.invoke_handler(call(cmd.as_ref())).err().unwrap();
        match err {
            EngineError::DomainRejection {
                aggregate_id,
                reason,
                ..
            } => {
                assert_eq!(aggregate_id, "A1");
                assert_eq!(reason, "nothing to deposit");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn missing_identifier_is_a_translation_error() {
        let flavour = flavour();
        let cmd: DomainMessage = Box::new(Deposit {
            account: String::new(),
            amount: 1,
        });
        let err = flavour
            .extract_aggregate_id("account", cmd.as_ref())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Translation);
    }
}
