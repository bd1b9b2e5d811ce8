//! Integration Tests for the Binding Layer
//!
//! These tests wire a factory into several trackers and verify that a
//! locator swap moves every tracker to the new resource and that teardown
//! leaves nothing behind.

mod common;

use std::sync::Arc;

use common::{eventually, init_tracing, record, settle};
use hotswap_core::factory::{FactoryConfig, ManagedResourceFactory};
use hotswap_core::log::memory::{MemoryLog, MemoryStore};
use hotswap_core::log::{LogResource, Locator, StoreKey};
use hotswap_core::reactive::{Node, NodeStatus, Source};
use hotswap_core::tracker::{
    HeadTracker, LatestValueTracker, LiveStreamTracker, RangeTracker, Tracker, Window,
};

fn log_named(store: &MemoryStore<String>, name: &str) -> MemoryLog<String> {
    store
        .log(&StoreKey::Name(name.to_string()))
        .expect("log was opened")
}

/// Test the full chain: locator swap -> factory -> trackers.
#[tokio::test]
async fn trackers_follow_a_factory_through_a_swap() {
    init_tracing();
    let store = Arc::new(MemoryStore::<String>::new());
    let config = Node::with_value(FactoryConfig::new(Locator::name("orders")));
    let factory = ManagedResourceFactory::new(store.clone(), Source::Observed(config.clone()));

    let latest = LatestValueTracker::new(factory.log_source());
    let live = LiveStreamTracker::new(factory.log_source());
    let head = HeadTracker::new(factory.log_source());
    let (tail, _sub) = record(live.output());

    assert!(eventually(|| live.stream_count() == 1).await);
    let orders = log_named(&store, "orders");
    orders.append("o1".to_string()).unwrap();
    orders.append("o2".to_string()).unwrap();

    assert!(eventually(|| latest.value().as_deref() == Some("o2")).await);
    assert!(eventually(|| head.value().as_deref() == Some("o1")).await);
    assert!(eventually(|| tail.lock().len() == 2).await);

    config.set(FactoryConfig::new(Locator::name("invoices")));
    assert!(eventually(|| store.log(&StoreKey::Name("invoices".into())).is_some()).await);
    let invoices = log_named(&store, "invoices");
    assert!(eventually(|| invoices.open_stream_count() == 1).await);
    assert!(orders.is_closed());

    invoices.append("i1".to_string()).unwrap();
    assert!(eventually(|| latest.value().as_deref() == Some("i1")).await);
    assert!(eventually(|| head.value().as_deref() == Some("i1")).await);
    assert!(eventually(|| tail.lock().len() == 3).await);
    settle().await;
    assert_eq!(*tail.lock(), vec!["o1", "o2", "i1"]);

    latest.complete().await;
    live.complete().await;
    head.complete().await;
    factory.complete().await;

    assert_eq!(live.stream_count(), 0);
    assert_eq!(invoices.append_listener_count(), 0);
    assert_eq!(invoices.close_listener_count(), 0);
    assert_eq!(invoices.open_stream_count(), 0);
    assert_eq!(orders.close_calls(), 1);
    assert_eq!(invoices.close_calls(), 1);
    assert_eq!(factory.created_count(), 0);
}

/// Test that a range over a factory output re-reads after a swap.
#[tokio::test]
async fn range_rereads_after_swap() {
    let store = Arc::new(MemoryStore::<String>::new());
    let config = Node::with_value(FactoryConfig {
        locator: Locator::name("a"),
        hotswap: false,
    });
    let factory = ManagedResourceFactory::new(store.clone(), Source::Observed(config.clone()));
    assert!(eventually(|| factory.created_count() == 1).await);
    log_named(&store, "a")
        .extend(["a0", "a1", "a2"].map(String::from))
        .unwrap();

    let window = Node::with_value(Window::from(-2));
    let range = RangeTracker::new(factory.log_source(), Source::Observed(window.clone()));
    assert!(eventually(|| range.value() == Some(vec!["a1".into(), "a2".into()])).await);

    config.set(FactoryConfig {
        locator: Locator::name("b"),
        hotswap: false,
    });
    assert!(eventually(|| factory.created_count() == 2).await);
    let b = log_named(&store, "b");
    b.extend(["b0", "b1"].map(String::from)).unwrap();
    window.set(Window::default());
    assert!(eventually(|| range.value() == Some(vec!["b0".into(), "b1".into()])).await);

    range.complete().await;
    factory.complete().await;
    assert_eq!(factory.created_count(), 0);
    assert_eq!(log_named(&store, "a").close_calls(), 1);
    assert_eq!(b.close_calls(), 1);
}

/// Test that trackers outlive the factory feeding them.
#[tokio::test]
async fn trackers_complete_independently_of_their_factory() {
    let store = Arc::new(MemoryStore::<String>::new());
    let config = FactoryConfig::new(Locator::name("x"));
    let factory = ManagedResourceFactory::new(store.clone(), Source::Static(config));
    let latest = LatestValueTracker::new(factory.log_source());

    assert!(eventually(|| factory.created_count() == 1).await);
    let x = log_named(&store, "x");
    x.append("x0".to_string()).unwrap();
    assert!(eventually(|| latest.value().as_deref() == Some("x0")).await);

    factory.complete().await;
    assert!(x.is_closed());
    assert!(eventually(|| x.append_listener_count() == 0).await);
    assert_eq!(latest.value().as_deref(), Some("x0"));
    assert_eq!(latest.output().status(), NodeStatus::Active);

    latest.complete().await;
    assert_eq!(latest.output().status(), NodeStatus::Completed);
}
