//! # event_engine
//!
//! An aggregate command-processing and event-sourcing runtime.
//!
//! Applications describe their write model declaratively with a [`Registry`]: which command is
//! processed by which aggregate type, which handler decides on it and which apply function folds
//! each recorded event into the aggregate state. The compiled descriptions only reference
//! functions by name; a [`Flavour`] binds those names to code and translates between the uniform
//! [`Message`] envelope and the types used by business logic. Three flavours ship with the crate:
//!
//! - [`PassThroughFlavour`]: handlers work on the envelopes and JSON state directly.
//! - [`FunctionalFlavour`]: typed messages, pure `decide` and `apply` free functions.
//! - [`ObjectFlavour`]: [`EventSourced`] aggregates recording events through a [`Recorder`].
//!
//! The [`EventMachine`] executes commands: it loads the aggregate from its latest snapshot and the
//! events recorded after it, runs the handler, applies the events and commits events and snapshot
//! atomically through a [`MultiModelStore`], guarded by optimistic concurrency. Committed events
//! then reach the registered [`EventListener`]s and wake the [`ProjectionEngine`], which keeps
//! versioned read models up to date in a [`DocumentStore`].
//!
//! ```rust,ignore
//! let descriptions = registry.compile()?;
//! let store = InMemoryStore::new();
//! let (trigger, wakeups) = projection_trigger();
//!
//! let machine = EventMachine::builder(descriptions.clone(), Arc::new(flavour), Arc::new(store.clone()))
//!     .notify_projections(trigger)
//!     .build()?;
//! let projections = ProjectionEngine::builder(&descriptions, Arc::new(store.clone()), Arc::new(store))
//!     .projector("BuildingProjector", building_projector)
//!     .build()?;
//! tokio::spawn(async move { projections.run(wakeups).await });
//!
//! machine
//!     .dispatch_command(Message::command("AddBuilding", payload(json!({"buildingId": "B1"}))))
//!     .await?;
//! ```

pub mod aggregate;
pub mod command;
pub mod config;
pub mod consumer;
pub mod description;
pub mod error;
pub mod flavour;
pub mod machine;
pub mod message;
pub mod projection;
pub mod query;
pub mod store;

pub use aggregate::{AggregateKey, AggregateSnapshot};
pub use command::{CommandController, ContextProvider};
pub use config::{EngineConfig, ProjectionConfig, SnapshotPolicy};
pub use consumer::EventListener;
pub use description::{CompiledDescriptions, Registry};
pub use error::{EngineError, ErrorKind, Rejection, Result};
pub use flavour::{
    Context, Decide, EventSourced, Flavour, FunctionalFlavour, ObjectFlavour, PassThroughFlavour,
    Recorder, TypedMessage,
};
pub use machine::{CommandOutcome, Dispatched, EventMachine};
pub use message::{Message, MessageKind, Payload, payload};
pub use projection::{
    AggregateStateProjector, ProjectionCursor, ProjectionEngine, ProjectionTrigger, Projector,
    projection_trigger,
};
pub use query::QueryResolver;
pub use store::{DocFilter, DocumentStore, InMemoryStore, MultiModelStore};

// Re-exporting uuid
pub use uuid::Uuid;
