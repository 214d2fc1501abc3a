//! Change notifications for selection updates.
//!
//! Events carry only the chain id; consumers re-read
//! [`RpcFailover::current_endpoints`](crate::RpcFailover::current_endpoints).

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::broadcast;

type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

const BROADCAST_CAPACITY: usize = 64;

/// Emitted after every applied selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub chain_id: String,
}

struct Registry {
    listeners: DashMap<u64, Listener>,
    next_id: AtomicU64,
    tx: broadcast::Sender<ChangeEvent>,
}

/// Listener registry plus a broadcast stream for async consumers.
#[derive(Clone)]
pub struct Notifier {
    registry: Arc<Registry>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            registry: Arc::new(Registry {
                listeners: DashMap::new(),
                next_id: AtomicU64::new(0),
                tx,
            }),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.listeners.insert(id, Arc::new(listener));
        Subscription {
            id: Some(id),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// A receiver of every future change event.
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.registry.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.registry.listeners.len()
    }

    /// Deliver `chain_id` to every listener and the broadcast stream.
    pub fn notify(&self, chain_id: &str) {
        let event = ChangeEvent {
            chain_id: chain_id.to_string(),
        };

        // Snapshot first so a listener may (un)subscribe without deadlocking.
        let listeners: Vec<Listener> = self
            .registry
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for listener in listeners {
            // A panicking listener must not take the probe loop down with it.
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(&event)));
            if let Err(payload) = outcome {
                tracing::error!(
                    chain_id = %event.chain_id,
                    panic = %panic_message(payload.as_ref()),
                    "change listener panicked"
                );
            }
        }

        // No receivers is fine.
        let _ = self.registry.tx.send(event);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered listener.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: Option<u64>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the listener registered for the notifier's lifetime.
    pub fn detach(mut self) {
        self.id = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let (Some(id), Some(registry)) = (self.id.take(), self.registry.upgrade()) {
            registry.listeners.remove(&id);
        }
    }
}
