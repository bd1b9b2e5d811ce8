//! Hotswap Core
//!
//! Reactive bindings over append-only log resources whose identity can
//! change at runtime. It provides:
//!
//! - Reactive cells ([`reactive::Node`]) and static-or-observed inputs
//! - Epoch-scoped resource bindings that discard stale async results
//! - Trackers: latest value, live tail, index range and fixed index
//! - A factory that opens resources from a keyed store and closes them
//!
//! # Architecture
//!
//! - `log`: the collaborator traits (`LogResource`, `LogStore`) and an
//!   in-memory implementation
//! - `reactive`: nodes, subscriptions and the `Tracked` result type
//! - `binding`: epochs, cancellation tokens and scoped tasks
//! - `tracker`: the trackers and their driver tasks
//! - `factory`: managed resource lifetimes
//!
//! Data flows factory → binding → trackers. A factory's output can be fed
//! straight into a tracker as its log reference.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hotswap_core::factory::{FactoryConfig, ManagedResourceFactory};
//! use hotswap_core::log::{memory::MemoryStore, Locator};
//! use hotswap_core::reactive::{Node, Source};
//! use hotswap_core::tracker::{LatestValueTracker, Tracker};
//!
//! let store = Arc::new(MemoryStore::<String>::new());
//! let config = Node::with_value(FactoryConfig::new(Locator::name("orders")));
//! let factory = ManagedResourceFactory::new(store, Source::Observed(config.clone()));
//!
//! let latest = LatestValueTracker::new(factory.log_source());
//! let _sub = latest.output().on_next(|entry| println!("latest: {entry}"));
//!
//! // Swap to another log; the tracker follows and the old log is closed.
//! config.set(FactoryConfig::new(Locator::name("invoices")));
//!
//! latest.complete().await;
//! factory.complete().await;
//! ```

pub mod binding;
pub mod error;
pub mod factory;
pub mod log;
pub mod reactive;
pub mod tracker;

pub use error::{Error, LogError, Result};
