//! Event system for async message handling.
//!
//! The event system fans device messages and connection lifecycle changes out
//! to any number of subscribers, and backs request/response correlation via
//! `wait_for`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::advertisement::Advertisement;
use crate::protocol::message::MessageType;
use crate::protocol::ProtoMessage;

/// Event types that can be dispatched.
#[derive(Debug, Clone)]
pub enum Event {
    /// Transport connected (handshake complete for encrypted links).
    Connected,
    /// Connection lost or closed.
    Disconnected,
    /// Hello/login sequence finished, requests are now accepted.
    Authorized,
    /// Authorization was lost along with the transport.
    Unauthorized,
    /// A reconnect attempt has been scheduled.
    ReconnectScheduled { delay: Duration },
    /// Non-fatal connection error.
    Error { message: String },
    /// A device message, delivered as raw type id plus payload.
    Message(ProtoMessage),
    /// A decoded Bluetooth LE advertisement.
    BleAdvertisement(Box<Advertisement>),
}

impl Event {
    /// Returns the associated message type if this event carries one.
    #[must_use]
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Self::Message(msg) => msg.message_type(),
            _ => None,
        }
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Waits for the next event.
    ///
    /// Returns `None` once the dispatcher is dropped. Lagged gaps are
    /// skipped silently.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Waits until an event matches the filter or the timeout expires.
    ///
    /// Returns `None` on timeout or when the dispatcher is dropped.
    /// Non-matching events are consumed and discarded, so a subscription
    /// used for correlation should be dedicated to that one exchange.
    pub async fn next_match(&mut self, filter: &EventFilter, timeout: Duration) -> Option<Event> {
        tokio::select! {
            biased;
            result = async {
                loop {
                    match self.recv().await {
                        Some(event) if filter.matches(&event) => return Some(event),
                        Some(_) => {}
                        None => return None,
                    }
                }
            } => result,
            () = tokio::time::sleep(timeout) => None,
        }
    }
}

/// Subscription filter for specific event types.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by device message types.
    pub message_types: Option<Vec<MessageType>>,
}

impl EventFilter {
    /// Creates a filter for a single message type.
    #[must_use]
    pub fn message_type(message_type: MessageType) -> Self {
        Self {
            message_types: Some(vec![message_type]),
        }
    }

    /// Creates a filter for several message types.
    #[must_use]
    pub const fn message_types(types: Vec<MessageType>) -> Self {
        Self {
            message_types: Some(types),
        }
    }

    /// Tests an event against this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref types) = self.message_types {
            match event.message_type() {
                Some(msg_type) => types.contains(&msg_type),
                None => false,
            }
        } else {
            true
        }
    }
}

struct EventDispatcherInner {
    sender: broadcast::Sender<Event>,
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<EventDispatcherInner>,
}

impl EventDispatcher {
    /// Creates a dispatcher with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);

        Self {
            inner: Arc::new(EventDispatcherInner { sender }),
        }
    }

    /// Publishes an event to every current subscriber.
    pub fn dispatch(&self, event: Event) {
        // A send error just means nobody is listening right now
        let _ = self.inner.sender.send(event);
    }

    /// Subscribes to all events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let receiver = self.inner.sender.subscribe();
        Subscription { receiver }
    }

    /// Waits for the next event matching the filter, with a timeout.
    ///
    /// The subscription only sees events dispatched after this call is
    /// polled; for request/response correlation subscribe first with
    /// [`subscribe`](Self::subscribe) and use
    /// [`Subscription::next_match`] after sending.
    pub async fn wait_for(&self, filter: EventFilter, timeout: Duration) -> Option<Event> {
        let mut subscription = self.subscribe();
        subscription.next_match(&filter, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(message_type: MessageType) -> ProtoMessage {
        ProtoMessage::empty(message_type)
    }

    #[tokio::test]
    async fn test_event_dispatch() {
        let dispatcher = EventDispatcher::new(16);
        let mut sub = dispatcher.subscribe();

        dispatcher.dispatch(Event::Connected);

        let event = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap();

        assert!(matches!(event, Some(Event::Connected)));
    }

    #[tokio::test]
    async fn test_next_match_skips_non_matching_events() {
        let dispatcher = EventDispatcher::new(16);
        let mut sub = dispatcher.subscribe();

        dispatcher.dispatch(Event::Connected);
        dispatcher.dispatch(Event::Message(msg(MessageType::HelloResponse)));
        dispatcher.dispatch(Event::Message(msg(MessageType::PingResponse)));

        let filter = EventFilter::message_type(MessageType::PingResponse);
        let event = sub.next_match(&filter, Duration::from_millis(250)).await;
        assert!(matches!(
            event,
            Some(Event::Message(m)) if m.message_type() == Some(MessageType::PingResponse)
        ));
    }

    #[test]
    fn test_message_type_filter() {
        let filter = EventFilter::message_types(vec![
            MessageType::PingResponse,
            MessageType::DeviceInfoResponse,
        ]);

        assert!(filter.matches(&Event::Message(msg(MessageType::PingResponse))));
        assert!(filter.matches(&Event::Message(msg(MessageType::DeviceInfoResponse))));
        assert!(!filter.matches(&Event::Message(msg(MessageType::HelloResponse))));
        assert!(!filter.matches(&Event::Connected));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = EventFilter::default();

        assert!(filter.matches(&Event::Connected));
        assert!(filter.matches(&Event::Message(msg(MessageType::HelloResponse))));
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_matching_message() {
        let dispatcher = EventDispatcher::new(16);

        let waiter = dispatcher.wait_for(
            EventFilter::message_type(MessageType::PingResponse),
            Duration::from_millis(250),
        );

        let clone = dispatcher.clone();
        let handle = tokio::spawn(async move {
            // An unrelated event first, then the one the filter wants
            clone.dispatch(Event::Message(msg(MessageType::HelloResponse)));
            clone.dispatch(Event::Message(msg(MessageType::PingResponse)));
        });

        let event = waiter.await;
        handle.await.unwrap();

        assert!(matches!(
            event,
            Some(Event::Message(m)) if m.message_type() == Some(MessageType::PingResponse)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out() {
        let dispatcher = EventDispatcher::new(16);

        let event = dispatcher
            .wait_for(
                EventFilter::message_type(MessageType::PingResponse),
                Duration::from_millis(50),
            )
            .await;

        assert!(event.is_none());
    }
}
