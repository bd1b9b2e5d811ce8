//! Error types for log collaborators and the binding layer.

use crate::log::ResourceId;

/// Errors reported by a log resource or a keyed store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// No entry exists at the requested index.
    #[error("no entry at index {index}")]
    NotFound {
        /// The index that was requested.
        index: u64,
    },

    /// The resource has been closed.
    #[error("log resource is closed")]
    Closed,

    /// The resource could not be opened.
    #[error("log resource failed to open: {0}")]
    ReadyFailed(String),

    /// The store could not produce a resource.
    #[error("log resource unavailable: {0}")]
    Unavailable(String),
}

/// Errors produced by the binding layer.
///
/// Errors are `Clone` because a terminal error is delivered to every
/// observer of a node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A locator named neither exactly a `name` nor exactly a `key`.
    #[error("invalid locator: {0}")]
    Configuration(&'static str),

    /// No log resource is bound.
    #[error("no log resource is bound")]
    BindingUnavailable,

    /// The bound resource failed to become ready.
    #[error("log {resource} failed to become ready: {source}")]
    ResourceReady {
        /// The resource that failed.
        resource: ResourceId,
        /// What the resource reported.
        source: LogError,
    },

    /// A read-stream failed. Recovered as end-of-stream by the trackers.
    #[error("read stream on log {resource} failed: {source}")]
    Stream {
        /// The resource the stream was reading.
        resource: ResourceId,
        /// What the stream reported.
        source: LogError,
    },

    /// Closing a managed resource failed.
    #[error("failed to close log {resource}: {source}")]
    Close {
        /// The resource that failed to close.
        resource: ResourceId,
        /// What the resource reported.
        source: LogError,
    },

    /// The keyed store could not resolve a locator.
    #[error("store lookup failed: {0}")]
    Store(LogError),
}

/// Result alias for the binding layer.
pub type Result<T> = std::result::Result<T, Error>;
