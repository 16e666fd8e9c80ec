//! Record-change event bus
//!
//! The record store stays a collaborator: operator actions publish change
//! events here and the system manager consumes them, instead of behavior
//! hanging off persistence callbacks. Lagging consumers simply miss events;
//! every consumer must tolerate that and reconcile from the store.

use tokio::sync::broadcast;

use crate::domain_types::SystemId;
use crate::storage::SystemRecord;

/// Capacity of the broadcast ring
const BUS_CAPACITY: usize = 256;

/// A change to the system records
#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// A system was created by the operator (or auto-enrolled)
    Created(SystemRecord),
    /// A system was deleted
    Deleted(SystemId),
    /// The operator paused monitoring
    Paused(SystemId),
    /// The operator resumed a paused system
    Resumed(SystemId),
    /// The fingerprint token was rotated
    TokenRotated(SystemId),
    /// The monitoring configuration changed
    ConfigChanged(SystemId),
}

/// Broadcast channel for [`SystemEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates the bus
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes an event; having no subscribers is fine
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let id = SystemId::generate();
        bus.publish(SystemEvent::TokenRotated(id.clone()));

        match rx.recv().await.unwrap() {
            SystemEvent::TokenRotated(got) => assert_eq!(got, id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(SystemEvent::Deleted(SystemId::generate()));
    }
}
