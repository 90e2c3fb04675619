//! In-process publish/subscribe event bus with at-least-once local delivery.
//! Events are dispatched by a single background task, so handlers for the
//! same process never run concurrently with each other.

use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;

pub type EventHandler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

struct Listener {
    id: u64,
    // None subscribes to every event type ("*")
    event_type: Option<String>,
    handler: EventHandler,
}

pub struct EventBus {
    tx: mpsc::UnboundedSender<(String, Value)>,
    listeners: Arc<RwLock<Vec<Listener>>>,
    next_listener_id: AtomicU64,
}

impl EventBus {
    /// Creates the bus and spawns its dispatch loop on the current runtime.
    pub fn new() -> Arc<EventBus> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Value)>();
        let listeners: Arc<RwLock<Vec<Listener>>> = Arc::new(RwLock::new(Vec::new()));

        let dispatch_listeners = listeners.clone();
        tokio::spawn(async move {
            while let Some((event_type, payload)) = rx.recv().await {
                let matching: Vec<EventHandler> = {
                    let guard = dispatch_listeners.read().unwrap();
                    guard
                        .iter()
                        .filter(|listener| match &listener.event_type {
                            None => true,
                            Some(subscribed) => subscribed == &event_type,
                        })
                        .map(|listener| listener.handler.clone())
                        .collect()
                };

                for handler in matching {
                    handler(event_type.clone(), payload.clone()).await;
                }
            }
        });

        Arc::new(EventBus {
            tx,
            listeners,
            next_listener_id: AtomicU64::new(0),
        })
    }

    /// Subscribes a handler to one event type, or to all events with `"*"`.
    /// Dropping the returned subscription removes the listener.
    pub fn subscribe(&self, event_type: &str, handler: EventHandler) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let listener = Listener {
            id,
            event_type: match event_type {
                "*" => None,
                other => Some(other.to_string()),
            },
            handler,
        };
        self.listeners.write().unwrap().push(listener);
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn publish(&self, event_type: &str, payload: Value) {
        // The dispatch loop lives as long as the bus, a send can only fail
        // during shutdown.
        let _ = self.tx.send((event_type.to_string(), payload));
    }
}

/// Handle for one bus listener. Unsubscribing is deterministic: after
/// `unsubscribe` (or drop) returns, the handler receives no further events.
pub struct Subscription {
    id: u64,
    listeners: Weak<RwLock<Vec<Listener>>>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .write()
                .unwrap()
                .retain(|listener| listener.id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
