//! Subscriber bookkeeping for the reactive system.
//!
//! Every listener registration (a node observer, an append callback on a log)
//! hands back a [`Subscription`]. Releasing the subscription removes the
//! listener, and the release runs exactly once whether it happens through
//! [`Subscription::unsubscribe`] or through `Drop`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Unique identifier for a subscriber.
///
/// Each registered listener gets a unique ID. The ID is what a
/// [`Subscription`] uses to find and remove its listener on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered listener.
///
/// Dropping the handle unregisters the listener.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: SubscriberId,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Create a subscription that runs `release` when it is let go.
    pub fn new<F>(id: SubscriberId, release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    /// A subscription with nothing to release.
    ///
    /// Returned when subscribing to something that can no longer emit, such
    /// as a static source or a terminated node.
    pub fn empty() -> Self {
        Self {
            id: SubscriberId::new(),
            release: None,
        }
    }

    /// Get the subscriber ID this subscription releases.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Whether the listener is still registered through this handle.
    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    /// Release the listener now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A registry of listeners of type `L`.
///
/// Listeners are stored behind `Arc` so notification can take a snapshot and
/// invoke callbacks without holding the lock. This lets a callback subscribe
/// or unsubscribe re-entrantly.
pub struct Listeners<L: ?Sized> {
    entries: Arc<Mutex<Vec<(SubscriberId, Arc<L>)>>>,
}

impl<L: ?Sized + Send + Sync + 'static> Listeners<L> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a listener.
    ///
    /// The returned subscription only holds a weak reference to the registry,
    /// so an outstanding subscription never keeps a dropped registry alive.
    pub fn insert(&self, listener: Arc<L>) -> Subscription {
        let id = SubscriberId::new();
        self.entries.lock().push((id, listener));

        let entries: Weak<Mutex<Vec<(SubscriberId, Arc<L>)>>> = Arc::downgrade(&self.entries);
        Subscription::new(id, move || {
            if let Some(entries) = entries.upgrade() {
                entries.lock().retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Clone out the current listeners.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Remove every listener and return them.
    pub fn drain(&self) -> Vec<Arc<L>> {
        self.entries
            .lock()
            .drain(..)
            .map(|(_, listener)| listener)
            .collect()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized + Send + Sync + 'static> Default for Listeners<L> {
    fn default() -> Self {
        Self::new()
    }
}
