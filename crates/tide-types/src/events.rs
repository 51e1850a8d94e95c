//! Typed, filterable event bus with bounded per-subscriber buffers.
//!
//! Each log owns its own [`EventBus`]. Subscribers register interest in a
//! set of event kinds and receive a FIFO stream of matching events through a
//! buffer of explicit capacity.
//!
//! # Overflow
//!
//! Events are never dropped silently. When a subscriber's buffer is full the
//! producer either waits for space ([`Overflow::Block`], the default) or the
//! event is counted on the subscription and logged at `warn`
//! ([`Overflow::Report`]).
//!
//! # Example
//!
//! ```rust
//! use tide_types::events::{BusEvent, EventBus, SubscribeOptions};
//!
//! #[derive(Clone, Debug)]
//! enum Ping { Hello(u32) }
//!
//! impl BusEvent for Ping {
//!     type Kind = ();
//!     fn kind(&self) -> Self::Kind {}
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::<Ping>::new();
//! let mut sub = bus.subscribe([()], SubscribeOptions::buffer(8)).unwrap();
//!
//! bus.emit(Ping::Hello(1)).await;
//!
//! let Some(Ping::Hello(n)) = sub.recv().await else { panic!() };
//! assert_eq!(n, 1);
//! # });
//! ```

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::warn;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Event trait
// ---------------------------------------------------------------------------

/// An event that can travel through an [`EventBus`].
///
/// `kind()` is the discriminant subscribers filter on.
pub trait BusEvent: Clone + Send + Sync + fmt::Debug + 'static {
    /// The kind discriminant.
    type Kind: Copy + Eq + Hash + Send + Sync + fmt::Debug + 'static;

    /// Return the kind of this event.
    fn kind(&self) -> Self::Kind;
}

/// Errors from the event bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// A subscription was requested with a zero-sized buffer.
    #[error("subscription capacity must be greater than zero")]
    InvalidCapacity,

    /// The bus has been closed.
    #[error("event bus closed")]
    Closed,
}

/// What `emit` does when a subscriber's buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Overflow {
    /// Wait for the subscriber to make room (back-pressure).
    #[default]
    Block,
    /// Do not wait: count the overflow on the subscription and warn.
    Report,
}

/// Options for [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Maximum number of buffered, undelivered events.
    pub capacity: usize,
    /// Behavior when the buffer is full.
    pub overflow: Overflow,
}

impl SubscribeOptions {
    /// Blocking subscription with the given buffer capacity.
    pub fn buffer(capacity: usize) -> Self {
        Self {
            capacity,
            overflow: Overflow::Block,
        }
    }

    /// Set the overflow behavior.
    pub fn with_overflow(mut self, overflow: Overflow) -> Self {
        self.overflow = overflow;
        self
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self::buffer(DEFAULT_CHANNEL_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct Subscriber<E: BusEvent> {
    id: u64,
    kinds: HashSet<E::Kind>,
    tx: mpsc::Sender<E>,
    overflow: Overflow,
    overflowed: Arc<AtomicU64>,
}

struct BusInner<E: BusEvent> {
    next_id: u64,
    subscribers: Vec<Arc<Subscriber<E>>>,
    closed: bool,
}

impl<E: BusEvent> BusInner<E> {
    fn remove(&mut self, id: u64) {
        self.subscribers.retain(|s| s.id != id);
    }
}

/// A typed event bus.
///
/// Clonable (`Arc` inside). Thread-safe. Each clone shares the same set of
/// subscribers.
pub struct EventBus<E: BusEvent> {
    inner: Arc<Mutex<BusInner<E>>>,
}

impl<E: BusEvent> EventBus<E> {
    /// Create a new bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                subscribers: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Subscribe to the given event kinds.
    ///
    /// Fails with [`BusError::InvalidCapacity`] for a zero capacity and with
    /// [`BusError::Closed`] once the bus has been closed.
    pub fn subscribe(
        &self,
        kinds: impl IntoIterator<Item = E::Kind>,
        options: SubscribeOptions,
    ) -> Result<Subscription<E>, BusError> {
        if options.capacity == 0 {
            return Err(BusError::InvalidCapacity);
        }

        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        if inner.closed {
            return Err(BusError::Closed);
        }

        let (tx, rx) = mpsc::channel(options.capacity);
        let overflowed = Arc::new(AtomicU64::new(0));
        let id = inner.next_id;
        inner.next_id += 1;

        inner.subscribers.push(Arc::new(Subscriber {
            id,
            kinds: kinds.into_iter().collect(),
            tx,
            overflow: options.overflow,
            overflowed: overflowed.clone(),
        }));

        Ok(Subscription {
            id,
            rx,
            overflowed,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Deliver an event to every subscriber interested in its kind.
    ///
    /// With [`Overflow::Block`] subscribers this waits until each of them
    /// has room. Subscribers whose receiving side is gone are removed.
    pub async fn emit(&self, event: E) {
        let kind = event.kind();
        let targets: Vec<Arc<Subscriber<E>>> = {
            let inner = self.inner.lock().expect("event bus lock poisoned");
            inner
                .subscribers
                .iter()
                .filter(|s| s.kinds.contains(&kind))
                .cloned()
                .collect()
        };

        for sub in targets {
            let delivered = match sub.overflow {
                Overflow::Block => sub.tx.send(event.clone()).await.is_ok(),
                Overflow::Report => match sub.tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let total = sub.overflowed.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            subscriber = sub.id,
                            ?kind,
                            overflowed = total,
                            "event subscriber buffer full, event not delivered"
                        );
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                },
            };

            if !delivered {
                self.inner
                    .lock()
                    .expect("event bus lock poisoned")
                    .remove(sub.id);
            }
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .expect("event bus lock poisoned")
            .subscribers
            .len()
    }

    /// Close the bus: drop every subscription and refuse new ones.
    ///
    /// Pending events already buffered are still delivered; afterwards
    /// `recv()` returns `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.closed = true;
        inner.subscribers.clear();
    }
}

impl<E: BusEvent> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("subscribers", &inner.subscribers.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live subscription to an [`EventBus`].
///
/// Dropping it unsubscribes.
pub struct Subscription<E: BusEvent> {
    id: u64,
    rx: mpsc::Receiver<E>,
    overflowed: Arc<AtomicU64>,
    bus: Weak<Mutex<BusInner<E>>>,
}

impl<E: BusEvent> Subscription<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Return the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Number of events this subscription failed to receive because its
    /// buffer was full ([`Overflow::Report`] only).
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    /// Unsubscribe. Events already buffered can no longer be read.
    pub fn close(self) {}

    fn detach(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.lock().expect("event bus lock poisoned").remove(self.id);
        }
    }
}

impl<E: BusEvent> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<E: BusEvent> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("overflowed", &self.overflowed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
