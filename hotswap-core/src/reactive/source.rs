//! Static-or-observed inputs.
//!
//! Tracker inputs (the log reference, the configuration) are either fixed at
//! construction or follow a [`Node`]. Callers say which by picking the
//! variant; nothing inspects the value to guess.

use std::sync::Arc;

use super::node::Node;
use super::subscriber::Subscription;
use crate::error::Error;

/// An input that is either a fixed value or the value of a node.
#[derive(Debug, Clone)]
pub enum Source<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A value that never changes.
    Static(T),

    /// A value that follows a node.
    Observed(Node<T>),
}

/// What an input delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent<T> {
    /// A new value.
    Next(T),

    /// The observed node errored.
    Error(Error),

    /// The observed node completed. The last value stays in effect.
    Complete,
}

impl<T> Source<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Deliver this input's values to `sink`.
    ///
    /// A static value is delivered once, synchronously. An observed node
    /// delivers its current value (if any) and every later one until the
    /// returned subscription is released.
    pub fn feed<F>(&self, sink: F) -> Subscription
    where
        F: Fn(SourceEvent<T>) + Send + Sync + 'static,
    {
        match self {
            Source::Static(value) => {
                sink(SourceEvent::Next(value.clone()));
                Subscription::empty()
            }
            Source::Observed(node) => {
                let sink = Arc::new(sink);
                let on_next = Arc::clone(&sink);
                let on_error = Arc::clone(&sink);
                node.subscribe(
                    move |value: &T| on_next(SourceEvent::Next(value.clone())),
                    move |e: &Error| on_error(SourceEvent::Error(e.clone())),
                    move || sink(SourceEvent::Complete),
                )
            }
        }
    }

    /// The value currently in effect, if any.
    pub fn current(&self) -> Option<T> {
        match self {
            Source::Static(value) => Some(value.clone()),
            Source::Observed(node) => node.get(),
        }
    }
}

impl<T> From<Node<T>> for Source<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from(node: Node<T>) -> Self {
        Source::Observed(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn collect<T: Clone + Send + Sync + 'static>(
        source: &Source<T>,
    ) -> (Arc<Mutex<Vec<SourceEvent<T>>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let subscription = source.feed(move |event| events_clone.lock().push(event));
        (events, subscription)
    }

    #[test]
    fn static_source_delivers_once() {
        let source = Source::Static(3);
        let (events, subscription) = collect(&source);

        assert_eq!(*events.lock(), vec![SourceEvent::Next(3)]);
        assert!(!subscription.is_active());
        assert_eq!(source.current(), Some(3));
    }

    #[test]
    fn observed_source_follows_node() {
        let node = Node::with_value(1);
        let source = Source::from(node.clone());
        let (events, subscription) = collect(&source);

        node.set(2);
        node.complete();

        assert_eq!(
            *events.lock(),
            vec![
                SourceEvent::Next(1),
                SourceEvent::Next(2),
                SourceEvent::Complete
            ]
        );
        drop(subscription);
    }

    #[test]
    fn releasing_feed_detaches_from_node() {
        let node = Node::new();
        let source = Source::Observed(node.clone());
        let (events, subscription) = collect(&source);

        subscription.unsubscribe();
        node.set(5);

        assert!(events.lock().is_empty());
        assert_eq!(node.subscriber_count(), 0);
    }
}
