use async_trait::async_trait;
use serde_json::Value;

use crate::Message;

/// Answers a query message, usually by reading a projection's read model.
///
/// Resolvers are bound with `register_query(name, schema).resolve_with(resolver)` and invoked by
/// [`EventMachine::dispatch_query`](crate::EventMachine::dispatch_query).
#[async_trait]
pub trait QueryResolver: Send + Sync {
    async fn resolve(&self, query: &Message) -> anyhow::Result<Value>;
}
