//! Resource Binding
//!
//! A [`ResourceBinding`] follows a log reference that may change at runtime.
//! Every time the reference moves to a different resource identity the
//! binding starts a new *epoch*:
//!
//! 1. the epoch counter is incremented;
//! 2. the cancellation token of the previous epoch is cancelled;
//! 3. the new resource is stored and a fresh token is issued.
//!
//! The old token is always cancelled before the caller sees the new epoch,
//! so nothing tied to the new epoch can be set up while work from the old
//! one is still considered live.
//!
//! Work that may outlive a swap (waiting for `ready()`, fetching an entry,
//! reading a range) runs through an [`EpochScope`]. Its result comes back
//! as a [`TrackedEntry`] carrying the epoch it was computed under, and
//! [`ResourceBinding::accepts`] rejects it once the binding has moved on.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::log::SharedLog;

/// A value computed under a given epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEntry<T> {
    /// Epoch the value was computed under.
    pub epoch: u64,
    /// The computed value.
    pub value: T,
}

/// The epoch and cancellation token of one bound resource.
#[derive(Debug, Clone)]
pub struct EpochScope {
    epoch: u64,
    token: CancellationToken,
}

impl EpochScope {
    /// The epoch this scope belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The token cancelled when this epoch is superseded.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the epoch has been superseded or released.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `work` on the runtime until it settles or the epoch ends.
    ///
    /// `settle` receives the result tagged with this epoch. If the token is
    /// cancelled first, `work` is dropped and `settle` never runs.
    pub fn spawn<F, S>(&self, work: F, settle: S) -> ScopedTask
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        S: FnOnce(TrackedEntry<F::Output>) + Send + 'static,
    {
        let epoch = self.epoch;
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    trace!(epoch, "scoped work abandoned");
                }
                value = work => settle(TrackedEntry { epoch, value }),
            }
        });
        ScopedTask { handle }
    }
}

/// A task started through [`EpochScope::spawn`].
///
/// Dropping the handle aborts the task.
#[derive(Debug)]
pub struct ScopedTask {
    handle: JoinHandle<()>,
}

impl ScopedTask {
    /// Whether the task has run to completion.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScopedTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Outcome of [`ResourceBinding::rebind`].
pub enum Rebind<E> {
    /// Same identity as before; nothing changed.
    Unchanged,

    /// A new resource is bound under a new epoch.
    Bound {
        /// Scope of the new epoch.
        scope: EpochScope,
        /// The newly bound resource.
        resource: SharedLog<E>,
    },

    /// The reference went away. Emission is suspended until rebound.
    Unbound {
        /// The epoch the binding moved to.
        epoch: u64,
    },
}

/// Tracks which log resource a tracker currently follows.
pub struct ResourceBinding<E> {
    current: Option<SharedLog<E>>,
    epoch: u64,
    token: CancellationToken,
}

impl<E> ResourceBinding<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Create an unbound binding at epoch 0.
    pub fn new() -> Self {
        Self {
            current: None,
            epoch: 0,
            token: CancellationToken::new(),
        }
    }

    /// Observe a (possibly new) reference.
    pub fn rebind(&mut self, next: Option<SharedLog<E>>) -> Rebind<E> {
        let unchanged = match (&self.current, &next) {
            (Some(current), Some(next)) => current.id() == next.id(),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return Rebind::Unchanged;
        }

        self.epoch += 1;
        self.token.cancel();
        self.token = CancellationToken::new();
        self.current = next;

        match &self.current {
            Some(resource) => {
                debug!(resource = %resource.id(), epoch = self.epoch, "log bound");
                Rebind::Bound {
                    scope: self.scope(),
                    resource: resource.clone(),
                }
            }
            None => {
                debug!(epoch = self.epoch, "log unbound");
                Rebind::Unbound { epoch: self.epoch }
            }
        }
    }

    /// The currently bound resource.
    pub fn current(&self) -> Option<&SharedLog<E>> {
        self.current.as_ref()
    }

    /// Whether a resource is bound.
    pub fn is_bound(&self) -> bool {
        self.current.is_some()
    }

    /// The current epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The token of the current epoch.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Scope of the current epoch.
    pub fn scope(&self) -> EpochScope {
        EpochScope {
            epoch: self.epoch,
            token: self.token.clone(),
        }
    }

    /// Whether `epoch` is the live epoch of a bound resource.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.current.is_some() && epoch == self.epoch && !self.token.is_cancelled()
    }

    /// Whether a settled value may still be delivered.
    pub fn accepts<T>(&self, entry: &TrackedEntry<T>) -> bool {
        self.is_current(entry.epoch)
    }

    /// End the binding: cancel the current token and forget the resource.
    pub fn release(&mut self) {
        self.token.cancel();
        self.current = None;
    }
}

impl<E> Default for ResourceBinding<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
