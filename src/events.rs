//! Lifecycle event broadcasting.
//!
//! The manager and datastores publish fire-and-forget lifecycle events.
//! Subscribers register for a bounded channel; a subscriber that lags past
//! its queue depth or drops its receiver is removed. Delivery order across
//! subscribers is unspecified, and subscriber failures never reach the
//! emitter.

use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, RecvError, Sender, TryRecvError, TrySendError, bounded};

use crate::config::Limits;

/// Datastore lifecycle notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatastoreEvent {
    /// First materialization of the datastore's directory.
    Created { name: String },
    Opened { name: String },
    Closed { name: String },
    Deleted { name: String },
}

impl DatastoreEvent {
    pub fn name(&self) -> &str {
        match self {
            DatastoreEvent::Created { name }
            | DatastoreEvent::Opened { name }
            | DatastoreEvent::Closed { name }
            | DatastoreEvent::Deleted { name } => name,
        }
    }
}

/// Receiving half of a subscription.
pub struct EventSubscription {
    receiver: Receiver<DatastoreEvent>,
}

impl EventSubscription {
    pub fn recv(&self) -> Result<DatastoreEvent, RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<DatastoreEvent, TryRecvError> {
        self.receiver.try_recv()
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<Sender<DatastoreEvent>>>>,
    queue_depth: usize,
    max_subscribers: usize,
}

impl EventBus {
    pub fn new(limits: &Limits) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            queue_depth: limits.max_event_queue_events,
            max_subscribers: limits.max_event_subscribers,
        }
    }

    /// Register a subscriber. Returns `None` when the subscriber cap is
    /// reached.
    pub fn subscribe(&self) -> Option<EventSubscription> {
        let mut subs = self.inner.lock().expect("event bus lock poisoned");
        if subs.len() >= self.max_subscribers {
            return None;
        }
        let (tx, rx) = bounded(self.queue_depth);
        subs.push(tx);
        Some(EventSubscription { receiver: rx })
    }

    /// Best-effort publish. Laggards and dropped receivers are pruned.
    pub fn publish(&self, event: DatastoreEvent) {
        let mut subs = self.inner.lock().expect("event bus lock poisoned");
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(event = ?event.name(), "event subscriber lagging, dropping");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("event bus lock poisoned").len()
    }
}
