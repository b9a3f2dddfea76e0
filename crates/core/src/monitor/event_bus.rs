//! Synchronous publish/subscribe bus

use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// An event stamped with its publication time
#[derive(Debug, Clone, PartialEq)]
pub struct EventAndTime<E> {
    pub event: E,
    /// Microseconds since the Unix epoch
    pub event_time_micros: u64,
}

type Subscriber<E> = Arc<dyn Fn(&EventAndTime<E>) + Send + Sync>;

/// Delivers every published event to all current subscribers on the
/// publishing thread
pub struct EventBus<E> {
    subscribers: Mutex<Vec<(u64, Subscriber<E>)>>,
    /// Held for the duration of a publish so unsubscribing waits for
    /// in-flight deliveries
    publishing: ReentrantMutex<()>,
    next_id: AtomicU64,
}

impl<E: Send + Sync + 'static> EventBus<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            publishing: ReentrantMutex::new(()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Register `callback`; it receives events until the returned
    /// [`Subscription`] is dropped
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&EventAndTime<E>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, Arc::new(callback)));

        let bus: Weak<Self> = Arc::downgrade(self);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(bus) = bus.upgrade() {
                    let _publishing = bus.publishing.lock();
                    bus.subscribers.lock().retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    /// Stamp `event` with the current time and deliver it
    pub fn publish(&self, event: E) {
        let event_and_time = EventAndTime {
            event,
            event_time_micros: now_micros(),
        };
        let _publishing = self.publishing.lock();
        let subscribers: Vec<Subscriber<E>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for subscriber in subscribers {
            subscriber(&event_and_time);
        }
    }

    /// Number of live subscriptions
    pub fn num_subscribers(&self) -> usize {
        self.subscribers.lock().len()
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Keeps a subscriber registered; dropping it unsubscribes. Once the drop
/// returns the subscriber is not called again, unless the drop happens
/// inside a delivery on the same thread.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}
