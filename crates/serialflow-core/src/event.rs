/*!
 * Event system for SerialFlow.
 *
 * Every event kind gets its own broadcast channel, keyed by the payload type.
 * Publishing never blocks and never fails because of a slow or dropped
 * subscriber: lagging receivers lose the oldest events, closed ones are
 * simply skipped.
 */
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{Error, Result};

/// Maximum number of events that can be buffered in a channel
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Receiving half of one event kind
pub type EventReceiver<T> = broadcast::Receiver<T>;

type EventSender<T> = broadcast::Sender<T>;

/// An event re-emitted with the identity of the source that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Tagged<K, E> {
    /// The originating source
    pub source: K,
    /// The original event
    pub event: E,
}

impl<K, E> Tagged<K, E> {
    /// Tag an event with its source
    pub fn new(source: K, event: E) -> Self {
        Self { source, event }
    }
}

/// Event bus for publishing and subscribing to events
pub struct EventBus {
    channels: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    channel_capacity: usize,
}

impl Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds = self.channels.lock().map(|c| c.len()).unwrap_or_default();
        f.debug_struct("EventBus")
            .field("event_kinds", &kinds)
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            channel_capacity: capacity.max(1),
        }
    }

    fn sender<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventSender<T>> {
        let type_id = TypeId::of::<T>();
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| Error::event("Failed to lock channels"))?;

        if let Some(sender) = channels.get(&type_id) {
            return sender
                .downcast_ref::<EventSender<T>>()
                .cloned()
                .ok_or_else(|| Error::event("Failed to downcast sender"));
        }

        let (sender, _) = broadcast::channel(self.channel_capacity);
        channels.insert(type_id, Box::new(sender.clone()));
        Ok(sender)
    }

    /// Publish an event, returning how many subscribers it reached
    pub fn publish<T: Clone + Debug + Send + Sync + 'static>(&self, event: T) -> Result<usize> {
        let sender = self.sender::<T>()?;

        // A send error only means nobody is listening right now.
        match sender.send(event) {
            Ok(n) => {
                trace!("Published event to {} receivers", n);
                Ok(n)
            }
            Err(_) => Ok(0),
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventReceiver<T>> {
        Ok(self.sender::<T>()?.subscribe())
    }

    /// Number of live subscribers for an event type
    pub fn subscriber_count<T: Clone + Debug + Send + Sync + 'static>(&self) -> usize {
        self.sender::<T>()
            .map(|sender| sender.receiver_count())
            .unwrap_or_default()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared event bus that can be cloned
#[derive(Debug, Clone, Default)]
pub struct SharedEventBus(Arc<EventBus>);

impl SharedEventBus {
    /// Create a new shared event bus
    pub fn new() -> Self {
        Self(Arc::new(EventBus::new()))
    }

    /// Create a new shared event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Arc::new(EventBus::with_capacity(capacity)))
    }

    /// Publish an event
    pub fn publish<T: Clone + Debug + Send + Sync + 'static>(&self, event: T) -> Result<usize> {
        self.0.publish(event)
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventReceiver<T>> {
        self.0.subscribe()
    }

    /// Number of live subscribers for an event type
    pub fn subscriber_count<T: Clone + Debug + Send + Sync + 'static>(&self) -> usize {
        self.0.subscriber_count::<T>()
    }
}
