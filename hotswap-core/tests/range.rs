//! Range snapshots.

mod common;

use common::{eventually, record, settle};
use hotswap_core::log::memory::MemoryLog;
use hotswap_core::log::SharedLog;
use hotswap_core::reactive::{Node, Source};
use hotswap_core::tracker::{self, RangeTracker, Tracker, Window};

#[tokio::test]
async fn window_follows_its_configuration() {
    let log = MemoryLog::from_entries(0..6);
    let window = Node::with_value(Window::from(2));
    let range = RangeTracker::new(tracker::fixed(log.shared()), Source::Observed(window.clone()));

    assert!(eventually(|| range.value() == Some(vec![2, 3, 4, 5])).await);

    window.set(Window::between(-3, -1));
    assert!(eventually(|| range.value() == Some(vec![3, 4])).await);

    range.complete().await;
    assert_eq!(log.open_stream_count(), 0);
}

#[tokio::test]
async fn inverted_window_is_empty() {
    let log = MemoryLog::from_entries(["a", "b", "c"]);
    let range = RangeTracker::new(
        tracker::fixed(log.shared()),
        Source::Static(Window::between(2, 1)),
    );

    assert!(eventually(|| range.value() == Some(Vec::new())).await);
    range.complete().await;
}

#[tokio::test]
async fn nothing_is_emitted_while_unbound() {
    let log = MemoryLog::from_entries([1, 2, 3]);
    let binding: Node<Option<SharedLog<i32>>> = Node::with_value(None);
    let range = RangeTracker::new(
        Source::Observed(binding.clone()),
        Source::Static(Window::default()),
    );
    let (seen, _sub) = record(range.output());

    settle().await;
    assert!(seen.lock().is_empty());

    binding.set(Some(log.shared()));
    assert!(eventually(|| range.value() == Some(vec![1, 2, 3])).await);

    binding.set(None);
    settle().await;
    assert_eq!(seen.lock().len(), 1);

    range.complete().await;
}

#[tokio::test]
async fn rebinding_reads_the_new_resource() {
    let first = MemoryLog::from_entries([1, 2, 3]);
    let second = MemoryLog::from_entries([7, 8, 9, 10]);
    let binding: Node<Option<SharedLog<i32>>> = Node::with_value(Some(first.shared()));
    let range = RangeTracker::new(
        Source::Observed(binding.clone()),
        Source::Static(Window::from(-2)),
    );

    assert!(eventually(|| range.value() == Some(vec![2, 3])).await);
    binding.set(Some(second.shared()));
    assert!(eventually(|| range.value() == Some(vec![9, 10])).await);

    range.complete().await;
}
