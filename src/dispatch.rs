use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::service::Service;

/// Host-bus action identifying [`Event::Connected`].
pub const ACTION_GATT_CONNECTED: &str = "ACTION_GATT_CONNECTED";
/// Host-bus action identifying [`Event::Disconnected`].
pub const ACTION_GATT_DISCONNECTED: &str = "ACTION_GATT_DISCONNECTED";
/// Host-bus action identifying [`Event::ServicesDiscovered`].
pub const ACTION_GATT_SERVICES_DISCOVERED: &str = "ACTION_GATT_SERVICES_DISCOVERED";
/// Host-bus action identifying [`Event::DataAvailable`].
pub const ACTION_DATA_AVAILABLE: &str = "ACTION_DATA_AVAILABLE";
/// Host-bus payload field name a [`Event::DataAvailable`] value is carried
/// under when re-broadcast by host glue.
pub const EXTRA_DATA: &str = "EXTRA_DATA";

/// Session events, in the order the mediator produced them.
#[derive(Debug, Clone)]
pub enum Event {
    /// The link to the peripheral came up. Operations are not accepted yet;
    /// service discovery runs first.
    Connected,
    /// The session ended. Every handle discovered in it is now invalid.
    Disconnected,
    /// Service discovery finished and the session accepts operations.
    ServicesDiscovered(Vec<Service>),
    /// A characteristic value arrived, from a completed read or a
    /// server-initiated notification or indication.
    DataAvailable {
        /// The originating characteristic.
        characteristic: Uuid,
        /// The payload bytes.
        value: Vec<u8>,
    },
}

impl Event {
    /// The host-bus action string for this event kind, for glue code that
    /// re-broadcasts session events on a platform intent/bus mechanism.
    pub fn action(&self) -> &'static str {
        match self {
            Event::Connected => ACTION_GATT_CONNECTED,
            Event::Disconnected => ACTION_GATT_DISCONNECTED,
            Event::ServicesDiscovered(_) => ACTION_GATT_SERVICES_DISCOVERED,
            Event::DataAvailable { .. } => ACTION_DATA_AVAILABLE,
        }
    }
}

/// Fans events out to every registered subscriber.
///
/// Publishing happens on the platform callback thread, so delivery is a
/// channel send only; subscriber code never runs under the publisher.
pub(crate) struct Dispatcher {
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Dispatcher {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        Subscription { receiver: rx }
    }

    /// Delivers `event` to every subscriber registered at this moment, in
    /// registration order, exactly once each. Subscriptions that have been
    /// dropped are pruned on the way through.
    pub(crate) fn publish(&self, event: Event) {
        debug!(action = event.action(), "publishing session event");
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

/// A subscriber's view of the session event stream.
///
/// Events published after the subscription was created arrive here in
/// publish order; there is no replay of earlier events. Dropping the
/// `Subscription` unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: Receiver<Event>,
}

impl Subscription {
    /// Blocks until the next event, or returns `None` once the client has
    /// been dropped and the queue is drained.
    pub fn recv(&self) -> Option<Event> {
        self.receiver.recv().ok()
    }

    /// Blocks for at most `timeout` waiting for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Returns the next already-queued event, if any.
    pub fn try_recv(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// Iterates over queued events without blocking.
    pub fn try_iter(&self) -> mpsc::TryIter<'_, Event> {
        self.receiver.try_iter()
    }

    /// Iterates blockingly until the client is dropped.
    pub fn iter(&self) -> mpsc::Iter<'_, Event> {
        self.receiver.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_in_publish_order() {
        let dispatcher = Dispatcher::new();
        let first = dispatcher.subscribe();
        let second = dispatcher.subscribe();

        dispatcher.publish(Event::Connected);
        dispatcher.publish(Event::ServicesDiscovered(Vec::new()));
        dispatcher.publish(Event::Disconnected);

        for sub in [&first, &second] {
            assert!(matches!(sub.try_recv(), Some(Event::Connected)));
            assert!(matches!(sub.try_recv(), Some(Event::ServicesDiscovered(_))));
            assert!(matches!(sub.try_recv(), Some(Event::Disconnected)));
            assert!(sub.try_recv().is_none());
        }
    }

    #[test]
    fn no_replay_for_late_subscribers() {
        let dispatcher = Dispatcher::new();
        dispatcher.publish(Event::Connected);

        let sub = dispatcher.subscribe();
        assert!(sub.try_recv().is_none());

        dispatcher.publish(Event::Disconnected);
        assert!(matches!(sub.try_recv(), Some(Event::Disconnected)));
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let dispatcher = Dispatcher::new();
        let keep = dispatcher.subscribe();
        let gone = dispatcher.subscribe();
        assert_eq!(dispatcher.subscriber_count(), 2);

        drop(gone);
        dispatcher.publish(Event::Connected);
        assert_eq!(dispatcher.subscriber_count(), 1);
        assert!(matches!(keep.try_recv(), Some(Event::Connected)));
    }

    #[test]
    fn action_strings() {
        assert_eq!(Event::Connected.action(), "ACTION_GATT_CONNECTED");
        assert_eq!(Event::Disconnected.action(), "ACTION_GATT_DISCONNECTED");
        assert_eq!(
            Event::ServicesDiscovered(Vec::new()).action(),
            "ACTION_GATT_SERVICES_DISCOVERED"
        );
        let data = Event::DataAvailable {
            characteristic: crate::btuuid::bluetooth_uuid_from_u16(0xffe1),
            value: vec![0x01],
        };
        assert_eq!(data.action(), "ACTION_DATA_AVAILABLE");
    }
}
