use async_trait::async_trait;

use crate::Message;

/// A trait that defines the behavior of an event listener.
///
/// Listeners are bound to event names with `on(event, listener)` and receive every committed event
/// of that name, in commit order, right after the command that recorded it succeeded. They are the
/// place for process managers and side effects such as notifications.
///
/// Failures are logged and never undo or fail the command: the events are already committed.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &Message) -> anyhow::Result<()>;
}
