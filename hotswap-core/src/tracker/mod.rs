//! Trackers
//!
//! A tracker derives a reactive value from whatever log resource its binding
//! currently points at:
//!
//! - [`LatestValueTracker`]: the entry at `length + offset`, refreshed on
//!   every append.
//! - [`LiveStreamTracker`]: every entry appended after subscription.
//! - [`RangeTracker`]: a snapshot of an index window.
//! - [`HeadTracker`]: the entry at a fixed index.
//!
//! # Execution Model
//!
//! Each tracker owns one driver task. Everything that can change the
//! tracker's state (a new log reference, a config change, an append
//! notification, a settled fetch, a stream entry) is turned into an event on
//! the driver's channel and handled one at a time, in arrival order. Async
//! work that may outlive a swap runs in an [`EpochScope`] and reports back
//! through the same channel, tagged with its epoch.
//!
//! Completing a tracker stops the driver, which releases every listener,
//! stream and in-flight task before the output node completes.
//!
//! [`EpochScope`]: crate::binding::EpochScope

mod head;
mod latest;
mod live;
mod range;

pub use head::{HeadConfig, HeadTracker};
pub use latest::{LatestConfig, LatestValueTracker};
pub use live::{LiveConfig, LiveStreamTracker};
pub use range::{RangeTracker, Window};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::binding::{EpochScope, ResourceBinding, ScopedTask, TrackedEntry};
use crate::error::{Error, LogError};
use crate::log::{Notify, SharedLog};
use crate::reactive::{Node, Source, SourceEvent, Subscription};

/// The log reference a tracker follows.
///
/// `None` means unbound: the tracker keeps its last value and emits nothing
/// until a resource is bound again.
pub type LogSource<E> = Source<Option<SharedLog<E>>>;

/// Follow a single resource that never changes.
pub fn fixed<E>(resource: SharedLog<E>) -> LogSource<E>
where
    E: Clone + Send + Sync + 'static,
{
    Source::Static(Some(resource))
}

/// What every tracker exposes to integrators.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// The emitted value type.
    type Output: Clone + Send + Sync + 'static;

    /// The node the tracker publishes through.
    fn output(&self) -> &Node<Self::Output>;

    /// The current value, or `None` if nothing was emitted yet.
    fn value(&self) -> Option<Self::Output> {
        self.output().get()
    }

    /// Observe the tracker's values and its terminal signal.
    fn subscribe<N, E, C>(&self, next: N, error: E, complete: C) -> Subscription
    where
        N: Fn(&Self::Output) + Send + Sync + 'static,
        E: Fn(&Error) + Send + Sync + 'static,
        C: Fn() + Send + Sync + 'static,
    {
        self.output().subscribe(next, error, complete)
    }

    /// Shut the tracker down.
    ///
    /// Resolves once every listener, stream and in-flight task owned by the
    /// tracker has been released. Idempotent.
    async fn complete(&self);
}

/// The driver task behind a tracker.
pub(crate) struct Driver {
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Driver {
    /// Spawn `run` with the shutdown token it must honour.
    pub(crate) fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(shutdown.clone()));
        Self {
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Signal shutdown and wait for the driver to finish its teardown.
    pub(crate) async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(error = %e, "tracker driver panicked");
                }
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Forward an input's events into a driver channel.
pub(crate) fn feed_into<T, Ev, F>(
    source: &Source<T>,
    events: &UnboundedSender<Ev>,
    wrap: F,
) -> Subscription
where
    T: Clone + Send + Sync + 'static,
    Ev: Send + 'static,
    F: Fn(SourceEvent<T>) -> Ev + Send + Sync + 'static,
{
    let events = events.clone();
    source.feed(move |event| {
        let _ = events.send(wrap(event));
    })
}

/// Wait for `resource` to become ready within `scope`.
pub(crate) fn await_ready<E, Ev, F>(
    scope: &EpochScope,
    resource: &SharedLog<E>,
    events: &UnboundedSender<Ev>,
    wrap: F,
) -> ScopedTask
where
    E: Clone + Send + Sync + 'static,
    Ev: Send + 'static,
    F: FnOnce(TrackedEntry<Result<(), LogError>>) -> Ev + Send + 'static,
{
    let resource = resource.clone();
    let events = events.clone();
    scope.spawn(async move { resource.ready().await }, move |entry| {
        let _ = events.send(wrap(entry));
    })
}

/// Register a notification on `resource` that posts `event()` to the driver.
pub(crate) fn notify_into<Ev, F>(events: &UnboundedSender<Ev>, event: F) -> Notify
where
    Ev: Send + 'static,
    F: Fn() -> Ev + Send + Sync + 'static,
{
    let events = events.clone();
    Arc::new(move || {
        let _ = events.send(event());
    })
}

/// Wait for the next driver event.
///
/// Returns `None` once shutdown is signalled or every sender is gone.
/// Shutdown wins over queued events.
pub(crate) async fn next_event<Ev>(
    inbox: &mut UnboundedReceiver<Ev>,
    shutdown: &CancellationToken,
) -> Option<Ev> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        event = inbox.recv() => event,
    }
}

/// How a settled `ready()` applies to the current binding.
pub(crate) enum ReadyOutcome<E> {
    /// Settled under an epoch the binding has left.
    Stale,
    /// The bound resource is ready.
    Ready(SharedLog<E>),
    /// The bound resource failed; terminal for the tracker.
    Failed(Error),
}

/// Check a settled `ready()` against `binding`.
pub(crate) fn check_ready<E>(
    binding: &ResourceBinding<E>,
    entry: TrackedEntry<Result<(), LogError>>,
) -> ReadyOutcome<E>
where
    E: Clone + Send + Sync + 'static,
{
    if !binding.accepts(&entry) {
        trace!(epoch = entry.epoch, "stale ready discarded");
        return ReadyOutcome::Stale;
    }
    let Some(resource) = binding.current() else {
        return ReadyOutcome::Stale;
    };
    match entry.value {
        Ok(()) => ReadyOutcome::Ready(resource.clone()),
        Err(source) => ReadyOutcome::Failed(Error::ResourceReady {
            resource: resource.id(),
            source,
        }),
    }
}
