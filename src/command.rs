use async_trait::async_trait;

use crate::{
    Message,
    flavour::{DomainMessage, DomainValue},
};

/// The `ContextProvider` trait supplies read-only context to a command handler.
///
/// It is bound with `provide_context(name)` in the descriptions and runs after the aggregate is
/// loaded and before its handler. Providers may read from anywhere (other read models, external
/// services) but must not write: nothing has been committed yet when they run. A failing provider
/// aborts the command before anything is appended.
///
/// The returned value reaches the handler through [`Context::get`](crate::flavour::Context::get).
///
/// ## Example
///
/// ```rust,ignore
/// struct KnownUsers(InMemoryStore);
///
/// #[async_trait]
/// impl ContextProvider for KnownUsers {
///     async fn provide(&self, _command: &DomainValue) -> anyhow::Result<DomainMessage> {
///         let users: Vec<Value> = self.0.find_docs("users", &DocFilter::Any).await?.collect();
///         Ok(Box::new(users))
///     }
/// }
/// ```
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn provide(&self, command: &DomainValue) -> anyhow::Result<DomainMessage>;
}

/// The `CommandController` trait handles commands routed with `pass(command, controller)`.
///
/// Controllers bypass the aggregate lifecycle entirely: nothing is loaded, recorded or committed
/// by the engine on their behalf.
#[async_trait]
pub trait CommandController: Send + Sync {
    async fn process(&self, command: &Message) -> anyhow::Result<()>;
}
