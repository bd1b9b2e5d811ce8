//! Reactive Primitives
//!
//! The small push-based core every tracker and the factory are built on.
//!
//! # Concepts
//!
//! ## Nodes
//!
//! A [`Node`] holds the latest value of a computation and pushes each new
//! value to its observers. It ends with either `complete` or `error`, and
//! replays its current value to late subscribers.
//!
//! ## Sources
//!
//! A [`Source`] is an input that is either fixed or follows a node. Tracker
//! configuration and log references are both sources.
//!
//! ## Subscriptions
//!
//! Every registration returns a [`Subscription`] guard. Releasing it, by
//! calling `unsubscribe` or dropping it, removes the listener exactly once.
//!
//! ## Tracked
//!
//! [`Tracked`] is the outcome of one computation step: a value, nothing this
//! round, or no resource bound.

mod node;
mod source;
mod subscriber;
mod tracked;

pub use node::{Node, NodeStatus};
pub use source::{Source, SourceEvent};
pub use subscriber::{Listeners, SubscriberId, Subscription};
pub use tracked::Tracked;
