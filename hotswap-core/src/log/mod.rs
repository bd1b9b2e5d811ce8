//! Log Collaborators
//!
//! The binding layer does not implement an append-only log or a keyed store.
//! It consumes them through the traits in this module:
//!
//! - [`LogResource`]: one open instance of an append-only log. Entries are
//!   immutable; `length` only grows; every append fires an append
//!   notification (no payload, observers re-read `length`); closing fires a
//!   close notification once.
//! - [`LogStore`]: looks up or creates log resources by [`StoreKey`]. The
//!   same key yields the same resource identity while that resource is open.
//!
//! [`memory`] holds an in-memory implementation of both.

pub mod memory;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::{Error, LogError};
use crate::reactive::Subscription;

/// Identity of one open log resource.
///
/// Two handles refer to the same resource exactly when their IDs are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Generate a new unique resource ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log-{}", self.0)
    }
}

/// Options for [`LogResource::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetOptions {
    /// Wait for the entry to be appended instead of returning `None`.
    pub wait: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self { wait: true }
    }
}

impl GetOptions {
    /// Return immediately when the entry is not available.
    pub fn no_wait() -> Self {
        Self { wait: false }
    }
}

/// Options for [`LogResource::create_read_stream`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadStreamOptions {
    /// First index to read. Defaults to 0.
    pub start: Option<u64>,
    /// Index to stop before. Defaults to the length at creation for a
    /// non-live stream and to "never" for a live one.
    pub end: Option<u64>,
    /// Keep yielding entries as they are appended.
    pub live: bool,
}

/// A sequence of entries produced by a read-stream.
pub type EntryStream<E> = BoxStream<'static, Result<E, LogError>>;

/// A notification callback registered on a resource.
pub type Notify = Arc<dyn Fn() + Send + Sync>;

/// A shared handle to a log resource.
pub type SharedLog<E> = Arc<dyn LogResource<Entry = E>>;

/// One open instance of an append-only log.
#[async_trait]
pub trait LogResource: Send + Sync {
    /// The entry type.
    type Entry: Clone + Send + Sync + 'static;

    /// Identity of this instance.
    fn id(&self) -> ResourceId;

    /// Wait until the resource is usable.
    async fn ready(&self) -> Result<(), LogError>;

    /// Current number of entries.
    fn length(&self) -> u64;

    /// Fetch the entry at `index`.
    ///
    /// With `wait == false`, returns `Ok(None)` when the entry does not
    /// exist yet.
    async fn get(&self, index: u64, opts: GetOptions) -> Result<Option<Self::Entry>, LogError>;

    /// Open a read-stream. Dropping the stream closes it.
    fn create_read_stream(&self, opts: ReadStreamOptions) -> EntryStream<Self::Entry>;

    /// Register an append notification.
    fn on_append(&self, notify: Notify) -> Subscription;

    /// Register a close notification. Fires at most once.
    fn on_close(&self, notify: Notify) -> Subscription;

    /// Close the resource.
    async fn close(&self) -> Result<(), LogError>;

    /// Whether the resource has been closed.
    fn is_closed(&self) -> bool;
}

/// How a store addresses a log resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKey {
    /// A human-readable name.
    Name(String),
    /// A raw key.
    Key(Vec<u8>),
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Name(name) => write!(f, "name:{name}"),
            StoreKey::Key(key) => {
                f.write_str("key:")?;
                for byte in key {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// A `{name}` xor `{key}` reference to a log resource.
///
/// Locators come from configuration, so both or neither field may be set.
/// [`Locator::resolve`] turns a valid one into a [`StoreKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Locator {
    /// Name of the resource.
    pub name: Option<String>,
    /// Raw key of the resource.
    pub key: Option<Vec<u8>>,
}

impl Locator {
    /// Locate by name.
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            key: None,
        }
    }

    /// Locate by key.
    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            name: None,
            key: Some(key.into()),
        }
    }

    /// Check that exactly one of `name` and `key` is set.
    pub fn resolve(&self) -> Result<StoreKey, Error> {
        match (&self.name, &self.key) {
            (Some(name), None) if !name.is_empty() => Ok(StoreKey::Name(name.clone())),
            (None, Some(key)) if !key.is_empty() => Ok(StoreKey::Key(key.clone())),
            (Some(_), Some(_)) => Err(Error::Configuration("both name and key are set")),
            _ => Err(Error::Configuration("one of name or key is required")),
        }
    }
}

/// A keyed store of log resources.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// The entry type of the store's resources.
    type Entry: Clone + Send + Sync + 'static;

    /// Look up or create the resource for `key`.
    fn get(&self, key: &StoreKey) -> Result<SharedLog<Self::Entry>, LogError>;

    /// Close the store and every resource it holds.
    async fn close(&self) -> Result<(), LogError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_requires_exactly_one_field() {
        assert_eq!(
            Locator::name("feed").resolve(),
            Ok(StoreKey::Name("feed".into()))
        );
        assert_eq!(
            Locator::key(vec![1, 2]).resolve(),
            Ok(StoreKey::Key(vec![1, 2]))
        );

        let both = Locator {
            name: Some("feed".into()),
            key: Some(vec![1]),
        };
        assert!(matches!(both.resolve(), Err(Error::Configuration(_))));
        assert!(matches!(
            Locator::default().resolve(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn empty_name_is_not_a_locator() {
        assert!(Locator::name("").resolve().is_err());
    }

    #[test]
    fn store_keys_display() {
        assert_eq!(StoreKey::Name("a".into()).to_string(), "name:a");
        assert_eq!(StoreKey::Key(vec![0xab, 0x01]).to_string(), "key:ab01");
    }

    #[test]
    fn resource_ids_are_unique() {
        let a = ResourceId::new();
        let b = ResourceId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), format!("log-{}", a.raw()));
    }
}
