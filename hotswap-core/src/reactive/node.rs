//! Node Implementation
//!
//! A Node is the reactive cell every tracker publishes through. It holds the
//! latest value and pushes each new value to its observers.
//!
//! # How Nodes Work
//!
//! 1. A node starts with no value. `get()` returns `None` until the first
//!    `set`.
//!
//! 2. Each `set` stores the value and calls `next` on every observer. There
//!    is no equality check: setting the same value twice emits twice, which
//!    is what a live entry stream needs.
//!
//! 3. `complete()` and `error()` are terminal. Observers are notified once
//!    and dropped; later `set` calls are ignored.
//!
//! 4. Subscribing replays the current value (if any) to the new observer,
//!    so late subscribers see the latest state.
//!
//! # Thread Safety
//!
//! Nodes are `Send + Sync` and cheap to clone (clones share state).
//! Emission is serialized per node: `set`, `subscribe` and the terminal calls
//! take the node's emission lock, so every observer sees values in `set`
//! order with the replay first and no duplicates. The lock is reentrant, so an
//! observer may subscribe, unsubscribe or set the same node from inside its
//! callback. Two nodes that set each other from different threads can
//! deadlock.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, RwLock};
use tracing::trace;

use super::subscriber::{Listeners, Subscription};
use crate::error::Error;

/// Counter for generating unique node IDs.
static NODE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique node ID.
fn next_node_id() -> u64 {
    NODE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    /// The node accepts and emits values.
    Active,

    /// The node completed normally.
    Completed,

    /// The node terminated with an error.
    Errored(Error),
}

/// The three callbacks of one observer.
struct Observer<T> {
    next: Box<dyn Fn(&T) + Send + Sync>,
    error: Box<dyn Fn(&Error) + Send + Sync>,
    complete: Box<dyn Fn() + Send + Sync>,
}

struct NodeInner<T> {
    emit: ReentrantMutex<()>,
    value: RwLock<Option<T>>,
    status: RwLock<NodeStatus>,
    observers: Listeners<Observer<T>>,
}

/// A reactive cell holding an optional value of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let node = Node::new();
/// let _sub = node.on_next(|v: &u32| println!("got {v}"));
///
/// node.set(5);        // prints "got 5"
/// node.complete();    // terminal, further sets are ignored
/// ```
pub struct Node<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Unique identifier for this node.
    id: u64,

    inner: Arc<NodeInner<T>>,
}

impl<T> Node<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a node with no value yet.
    pub fn new() -> Self {
        Self {
            id: next_node_id(),
            inner: Arc::new(NodeInner {
                emit: ReentrantMutex::new(()),
                value: RwLock::new(None),
                status: RwLock::new(NodeStatus::Active),
                observers: Listeners::new(),
            }),
        }
    }

    /// Create a node holding an initial value.
    pub fn with_value(value: T) -> Self {
        let node = Self::new();
        *node.inner.value.write() = Some(value);
        node
    }

    /// Get the node's unique ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the current value, or `None` if nothing was emitted yet.
    pub fn get(&self) -> Option<T> {
        self.inner.value.read().clone()
    }

    /// Whether the node holds a value.
    pub fn has_value(&self) -> bool {
        self.inner.value.read().is_some()
    }

    /// Store a new value and push it to every observer.
    ///
    /// Ignored once the node is terminated.
    pub fn set(&self, value: T) {
        let _emit = self.inner.emit.lock();
        if self.is_terminated() {
            trace!(node = self.id, "set on terminated node ignored");
            return;
        }

        let emitted = value.clone();
        *self.inner.value.write() = Some(value);

        for observer in self.inner.observers.snapshot() {
            (observer.next)(&emitted);
        }
    }

    /// Compute the next value from the current one and set it.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(Option<&T>) -> T,
    {
        let next = {
            let guard = self.inner.value.read();
            f(guard.as_ref())
        };
        self.set(next);
    }

    /// Register an observer.
    ///
    /// The current value, if any, is replayed to `next` right away. On a
    /// terminated node the matching terminal callback runs immediately and an
    /// empty subscription is returned.
    pub fn subscribe<N, E, C>(&self, next: N, error: E, complete: C) -> Subscription
    where
        N: Fn(&T) + Send + Sync + 'static,
        E: Fn(&Error) + Send + Sync + 'static,
        C: Fn() + Send + Sync + 'static,
    {
        let _emit = self.inner.emit.lock();
        match self.status() {
            NodeStatus::Completed => {
                complete();
                return Subscription::empty();
            }
            NodeStatus::Errored(e) => {
                error(&e);
                return Subscription::empty();
            }
            NodeStatus::Active => {}
        }

        let observer = Arc::new(Observer {
            next: Box::new(next),
            error: Box::new(error),
            complete: Box::new(complete),
        });
        let subscription = self.inner.observers.insert(Arc::clone(&observer));

        if let Some(current) = self.get() {
            (observer.next)(&current);
        }

        subscription
    }

    /// Register an observer that only cares about values.
    pub fn on_next<N>(&self, next: N) -> Subscription
    where
        N: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe(next, |_| {}, || {})
    }

    /// Terminate the node normally.
    ///
    /// Returns `false` if the node was already terminated.
    pub fn complete(&self) -> bool {
        let _emit = self.inner.emit.lock();
        if !self.terminate(NodeStatus::Completed) {
            return false;
        }
        for observer in self.inner.observers.drain() {
            (observer.complete)();
        }
        true
    }

    /// Terminate the node with an error.
    ///
    /// Returns `false` if the node was already terminated.
    pub fn error(&self, error: Error) -> bool {
        let _emit = self.inner.emit.lock();
        if !self.terminate(NodeStatus::Errored(error.clone())) {
            return false;
        }
        for observer in self.inner.observers.drain() {
            (observer.error)(&error);
        }
        true
    }

    fn terminate(&self, status: NodeStatus) -> bool {
        let mut guard = self.inner.status.write();
        if *guard != NodeStatus::Active {
            return false;
        }
        trace!(node = self.id, ?status, "node terminated");
        *guard = status;
        true
    }

    /// Get the lifecycle state.
    pub fn status(&self) -> NodeStatus {
        self.inner.status.read().clone()
    }

    /// Whether the node completed or errored.
    pub fn is_terminated(&self) -> bool {
        *self.inner.status.read() != NodeStatus::Active
    }

    /// Get the number of registered observers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.observers.len()
    }
}

impl<T> Default for Node<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Node<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Node<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("value", &self.get())
            .field("status", &self.status())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn node_get_and_set() {
        let node = Node::new();
        assert_eq!(node.get(), None);

        node.set(42);
        assert_eq!(node.get(), Some(42));
    }

    #[test]
    fn node_update() {
        let node = Node::with_value(10);
        node.update(|v| v.copied().unwrap_or_default() + 5);
        assert_eq!(node.get(), Some(15));
    }

    #[test]
    fn node_emits_every_set() {
        let node = Node::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _sub = node.on_next(move |v: &i32| seen_clone.lock().push(*v));

        node.set(1);
        node.set(1);
        node.set(2);
        assert_eq!(*seen.lock(), vec![1, 1, 2]);
    }

    #[test]
    fn subscribe_replays_current_value() {
        let node = Node::with_value("ready");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _sub = node.on_next(move |v: &&str| seen_clone.lock().push(*v));
        assert_eq!(*seen.lock(), vec!["ready"]);
    }

    #[test]
    fn node_unsubscribe() {
        let node = Node::new();
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let subscription = node.on_next(move |_: &i32| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
        });
        node.set(1);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        assert_eq!(node.subscriber_count(), 0);

        node.set(2);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn complete_is_terminal() {
        let node = Node::new();
        let completed = Arc::new(AtomicI32::new(0));
        let completed_clone = completed.clone();

        let _sub = node.subscribe(
            |_: &i32| {},
            |_| {},
            move || {
                completed_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert!(node.complete());
        assert!(!node.complete());
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(node.subscriber_count(), 0);

        node.set(7);
        assert_eq!(node.get(), None);
    }

    #[test]
    fn error_reaches_observers_and_late_subscribers() {
        let node: Node<i32> = Node::new();
        let errors = Arc::new(Mutex::new(Vec::new()));

        let errors_clone = errors.clone();
        let _sub = node.subscribe(|_| {}, move |e| errors_clone.lock().push(e.clone()), || {});

        assert!(node.error(Error::BindingUnavailable));
        assert_eq!(node.status(), NodeStatus::Errored(Error::BindingUnavailable));

        let errors_clone = errors.clone();
        let late = node.subscribe(|_| {}, move |e| errors_clone.lock().push(e.clone()), || {});
        assert!(!late.is_active());
        assert_eq!(errors.lock().len(), 2);
    }

    #[test]
    fn node_clone_shares_state() {
        let node1 = Node::new();
        let node2 = node1.clone();

        node1.set(42);
        assert_eq!(node2.get(), Some(42));
        assert_eq!(node1.id(), node2.id());
    }

    #[test]
    fn observer_may_unsubscribe_itself() {
        let node = Node::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_clone = slot.clone();

        let subscription = node.on_next(move |_: &i32| {
            if let Some(sub) = slot_clone.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(subscription);

        node.set(1);
        assert_eq!(node.subscriber_count(), 0);
    }

    #[test]
    fn late_subscribers_see_values_in_order_while_another_thread_sets() {
        for _ in 0..50 {
            let node = Node::with_value(0u32);
            let setter = {
                let node = node.clone();
                std::thread::spawn(move || {
                    for v in 1..=200 {
                        node.set(v);
                    }
                })
            };

            let mut observed = Vec::new();
            for _ in 0..20 {
                let seen = Arc::new(Mutex::new(Vec::new()));
                let seen_clone = seen.clone();
                let sub = node.on_next(move |v: &u32| seen_clone.lock().push(*v));
                observed.push((seen, sub));
            }
            setter.join().unwrap();

            for (seen, _sub) in &observed {
                let seen = seen.lock();
                assert!(!seen.is_empty());
                assert!(
                    seen.windows(2).all(|pair| pair[0] < pair[1]),
                    "duplicate or out-of-order delivery: {seen:?}"
                );
                assert_eq!(seen.last(), Some(&200));
            }
        }
    }
}
