//! Type-safe event bus for request lifecycle notifications.
//!
//! Components emit typed events and subscribers receive only the event types
//! they asked for. Each event type gets its own lazily created
//! `tokio::sync::broadcast` channel, keyed by `TypeId`.
//!
//! ```rust
//! use jdma_types::events::{EventBus, RequestSubmitted};
//! use jdma_types::{BatchId, RequestId, RequestKind};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<RequestSubmitted>();
//!
//! bus.emit(RequestSubmitted {
//!     request_id: RequestId::new(1),
//!     batch_id: BatchId::new(1),
//!     kind: RequestKind::Put,
//! });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.request_id, RequestId::new(1));
//! # });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::{BatchId, FailureReason, RequestId, RequestKind, RequestState};

/// Marker trait for everything that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A request was accepted and persisted in `Pending`.
#[derive(Clone, Debug)]
pub struct RequestSubmitted {
    pub request_id: RequestId,
    pub batch_id: BatchId,
    pub kind: RequestKind,
}
impl Event for RequestSubmitted {}

/// A request's state was durably changed.
#[derive(Clone, Debug)]
pub struct StateChanged {
    pub request_id: RequestId,
    pub batch_id: BatchId,
    pub kind: RequestKind,
    pub from: RequestState,
    pub to: RequestState,
}
impl Event for StateChanged {}

/// A request reached `Failed`.
#[derive(Clone, Debug)]
pub struct RequestFailed {
    pub request_id: RequestId,
    pub batch_id: BatchId,
    /// State the request was in when it failed.
    pub state: RequestState,
    pub reason: FailureReason,
}
impl Event for RequestFailed {}

/// A request outlived the staleness window in an active state.
#[derive(Clone, Debug)]
pub struct RequestStalled {
    pub request_id: RequestId,
    pub state: RequestState,
    /// True if the request was requeued, false if it was failed.
    pub requeued: bool,
}
impl Event for RequestStalled {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

struct EventBusInner {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// Clonable, thread-safe bus. Emits never block.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    ///
    /// Dropped silently when nobody is subscribed.
    pub fn emit<E: Event>(&self, event: E) {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        if let Some(sender) = inner
            .channels
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`. Only events emitted after this call are seen.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let sender = inner
            .channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
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
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

/// Typed receiver for one event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take every event already buffered without waiting.
    pub fn drain(&mut self) -> Vec<E> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "event receiver lagged");
                }
                Err(_) => return out,
            }
        }
    }
}
