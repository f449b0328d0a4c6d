//! Change event stream.
//!
//! Local storage publishes one [`StoreChangeEvent`] per logical write. The
//! stream fans events out to any number of subscribers, each with its own
//! unbounded channel and an optional [`EventFilter`].

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::StoreName;

/// Kind of change a store went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Add,
    Update,
    Delete,
    /// A client-generated key was replaced by the server key.
    IdSwap,
}

/// Who caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Application write. Captured by the mutation queue.
    User,
    /// Write applied from the remote. Never re-enters the queue.
    Replication,
}

/// A change to one store.
///
/// `data` is an array of the affected records for add/update/delete, and
/// `{"previous": .., "current": ..}` for an id swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreChangeEvent {
    pub event_type: EventType,
    pub store_name: StoreName,
    pub data: Value,
    pub event_source: EventSource,
}

impl StoreChangeEvent {
    pub fn new(
        event_type: EventType,
        store_name: impl Into<StoreName>,
        data: Value,
        event_source: EventSource,
    ) -> Self {
        Self {
            event_type,
            store_name: store_name.into(),
            data,
            event_source,
        }
    }
}

/// Which events a subscriber wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub store_name: Option<StoreName>,
    pub event_type: Option<EventType>,
}

impl EventFilter {
    /// Accept everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn store(store_name: impl Into<StoreName>) -> Self {
        Self {
            store_name: Some(store_name.into()),
            event_type: None,
        }
    }

    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn matches(&self, event: &StoreChangeEvent) -> bool {
        self.store_name
            .as_ref()
            .map_or(true, |s| *s == event.store_name)
            && self.event_type.map_or(true, |t| t == event.event_type)
    }
}

/// Sender half of a subscription.
pub type EventSender = mpsc::UnboundedSender<StoreChangeEvent>;

#[derive(Debug)]
struct Subscriber {
    filter: EventFilter,
    sender: EventSender,
}

#[derive(Debug, Default)]
struct Subscribers {
    entries: DashMap<String, Subscriber>,
}

/// Ordered multi-subscriber pub/sub of store changes.
///
/// Cheap to clone; clones share the same subscriber set.
#[derive(Debug, Clone, Default)]
pub struct ChangeEventStream {
    inner: Arc<Subscribers>,
}

impl ChangeEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber.
    ///
    /// Events published after this call are delivered in publish order.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().to_string();

        self.inner
            .entries
            .insert(id.clone(), Subscriber { filter, sender });

        tracing::trace!(subscription = %id, "event subscriber registered");

        Subscription {
            id,
            receiver,
            stream: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every matching subscriber.
    ///
    /// Returns the number of subscribers that received it. Subscribers whose
    /// receiver is gone are pruned.
    pub fn publish(&self, event: &StoreChangeEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.inner.entries.iter() {
            let subscriber = entry.value();
            if !subscriber.filter.matches(event) {
                continue;
            }
            if subscriber.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(entry.key().clone());
            }
        }

        for id in closed {
            self.inner.entries.remove(&id);
        }

        tracing::trace!(
            store = %event.store_name,
            event_type = ?event.event_type,
            recipients = delivered,
            "published change event"
        );

        delivered
    }

    /// Close every subscription. Pending events can still be drained.
    pub fn finish(&self) {
        let count = self.inner.entries.len();
        self.inner.entries.clear();
        tracing::debug!(subscribers = count, "change event stream finished");
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.entries.len()
    }
}

/// Handle to a registered subscriber. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    receiver: mpsc::UnboundedReceiver<StoreChangeEvent>,
    stream: Weak<Subscribers>,
}

impl Subscription {
    /// Wait for the next event. `None` once the stream is finished and drained.
    pub async fn recv(&mut self) -> Option<StoreChangeEvent> {
        self.receiver.recv().await
    }

    /// Next buffered event, if any.
    pub fn try_recv(&mut self) -> Option<StoreChangeEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<StoreChangeEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.entries.remove(&self.id);
        }
    }
}
