//! Event dispatch bus
//!
//! Fans canonical events out to a global broadcast channel (any part of the
//! application may subscribe) and to handlers registered for one event type.
//! Dispatch order is the order of `dispatch` calls; the proxy calls it from a
//! single task per connection, so delivery is FIFO per connection.

use crate::event::CanonicalEvent;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{trace, warn};

const EVENT_BUFFER: usize = 1024;

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Token returned by [`EventBus::on`], used to unregister the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Handlers {
    by_kind: HashMap<String, Vec<(HandlerId, Handler)>>,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CanonicalEvent>,
    handlers: Arc<RwLock<Handlers>>,
    next_id: Arc<AtomicU64>,
}

/// Receiver half of the global channel
#[derive(Debug)]
pub struct EventRx {
    rx: broadcast::Receiver<CanonicalEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUFFER);
        Self {
            tx,
            handlers: Arc::new(RwLock::new(Handlers::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Publish an event globally and run the handlers registered for `kind`.
    pub fn dispatch(&self, kind: &str, data: Value) {
        let handlers: Vec<Handler> = match self.handlers.read() {
            Ok(h) => h
                .by_kind
                .get(kind)
                .map(|list| list.iter().map(|(_, f)| Arc::clone(f)).collect())
                .unwrap_or_default(),
            Err(_) => {
                warn!(%kind, "handler registry poisoned");
                Vec::new()
            }
        };

        // Runs outside the lock: handlers may register or remove handlers.
        for handler in &handlers {
            handler(&data);
        }

        trace!(%kind, handlers = handlers.len(), "dispatch");
        // No subscribers is fine: the event is simply not observed.
        let _ = self.tx.send(CanonicalEvent::new(kind, data));
    }

    /// Register a handler for one event type.
    pub fn on<F>(&self, kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut h) = self.handlers.write() {
            h.by_kind
                .entry(kind.into())
                .or_default()
                .push((id, Arc::new(handler)));
        }
        id
    }

    /// Remove a handler. Unknown ids are ignored.
    pub fn off(&self, id: HandlerId) {
        if let Ok(mut h) = self.handlers.write() {
            for list in h.by_kind.values_mut() {
                list.retain(|(existing, _)| *existing != id);
            }
            h.by_kind.retain(|_, list| !list.is_empty());
        }
    }

    /// Subscribe to every dispatched event.
    ///
    /// Lagged receivers skip the events they missed; presence resyncs from
    /// snapshots, so nothing here tries to recover them.
    pub fn subscribe(&self) -> EventRx {
        EventRx {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

impl EventRx {
    pub async fn recv(&mut self) -> Option<CanonicalEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    trace!(skipped = n, "event receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
