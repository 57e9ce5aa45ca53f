use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;
use uuid::Uuid;

use crate::protocol::{EventKind, LifecycleEvent};

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](EventBus::subscribe) creates a new receiver that
/// will receive all events published after the subscription was created. The
/// bus is thread-safe and can be cloned cheaply.
///
/// Publishing is fire-and-forget: a slow or vanished subscriber never
/// surfaces an error to the publisher.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<LifecycleEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<LifecycleEvent> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Publish an event to all current subscribers.
    ///
    /// Disconnected subscribers (whose receivers have been dropped) are
    /// pruned.
    pub fn publish(&self, event: LifecycleEvent) {
        trace!(task_id = %event.task_id, event = event.kind.name(), "publish");
        self.senders()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Shorthand for building and publishing a [`LifecycleEvent`].
    pub fn emit(&self, task_id: Uuid, kind: EventKind, message: impl Into<String>) {
        self.publish(LifecycleEvent::new(task_id, kind, message));
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }

    fn senders(&self) -> std::sync::MutexGuard<'_, Vec<flume::Sender<LifecycleEvent>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
