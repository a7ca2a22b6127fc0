//! NotificationBus: fans Application change events out to filtered subscribers
//!
//! Each subscriber owns a bounded queue. Publishing never blocks: when a
//! subscriber's queue is full the event is dropped for that subscriber and a
//! warning is logged; when its receiver is gone it is deregistered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use keel_common::crd::Application;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::DEFAULT_WATCH_BUFFER_SIZE;

/// Kind of change observed on the store's watch feed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Object first seen
    Added,
    /// Object changed
    Modified,
    /// Object removed
    Deleted,
}

/// A change to an Application
#[derive(Clone, Debug)]
pub struct ApplicationEvent {
    /// What happened
    pub type_: EventType,
    /// The Application as of the event
    pub application: Application,
}

impl ApplicationEvent {
    /// Create an event
    pub fn new(type_: EventType, application: Application) -> Self {
        Self { type_, application }
    }
}

type Predicate = Box<dyn Fn(&Application) -> bool + Send + Sync>;

struct Subscriber {
    predicate: Predicate,
    tx: mpsc::Sender<ApplicationEvent>,
}

#[derive(Default)]
struct Registry {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

/// In-process pub/sub for Application events
#[derive(Clone)]
pub struct NotificationBus {
    registry: Arc<Registry>,
    capacity: usize,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_WATCH_BUFFER_SIZE)
    }
}

impl NotificationBus {
    /// Create a bus whose subscribers buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            capacity: capacity.max(1),
        }
    }

    /// Register a subscriber that receives events whose Application matches `predicate`
    pub fn subscribe<P>(&self, predicate: P) -> Subscription
    where
        P: Fn(&Application) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.subscribers.insert(
            id,
            Subscriber {
                predicate: Box::new(predicate),
                tx,
            },
        );
        debug!(subscriber = id, "subscribed to application events");
        Subscription {
            id,
            rx,
            registry: Arc::clone(&self.registry),
            active: true,
        }
    }

    /// Deliver an event to every matching subscriber
    pub fn publish(&self, event: ApplicationEvent) {
        let mut closed = Vec::new();
        for entry in self.registry.subscribers.iter() {
            if !(entry.predicate)(&event.application) {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        subscriber = *entry.key(),
                        application = %event.application.qualified_name(),
                        "subscriber queue is full, dropping application event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }
        for id in closed {
            self.registry.subscribers.remove(&id);
        }
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.len()
    }
}

/// Receiving end of a bus subscription; deregisters on drop
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<ApplicationEvent>,
    registry: Arc<Registry>,
    active: bool,
}

impl Subscription {
    /// Next event, or `None` once unsubscribed.
    ///
    /// Events still queued at unsubscribe time are discarded.
    pub async fn recv(&mut self) -> Option<ApplicationEvent> {
        if !self.active {
            return None;
        }
        self.rx.recv().await
    }

    /// Stop delivery. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.registry.subscribers.remove(&self.id);
        self.rx.close();
        debug!(subscriber = self.id, "unsubscribed from application events");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
