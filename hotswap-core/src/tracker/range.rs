//! Range snapshots.
//!
//! Reads a `[start, end)` window of the bound log with a non-live stream and
//! emits the collected entries as one array. Negative bounds count back from
//! the length read at the moment the window is resolved.

use std::ops::ControlFlow;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    await_ready, check_ready, feed_into, next_event, Driver, LogSource, ReadyOutcome, Tracker,
};
use crate::binding::{Rebind, ResourceBinding, ScopedTask, TrackedEntry};
use crate::error::{Error, LogError};
use crate::log::{ReadStreamOptions, SharedLog};
use crate::reactive::{Node, Source, SourceEvent, Subscription};

/// An index window. Negative bounds are relative to the length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Window {
    /// First index, inclusive. Defaults to 0.
    pub start: Option<i64>,
    /// Last index, exclusive. Defaults to the length.
    pub end: Option<i64>,
}

impl Window {
    /// A window from `start` to the end of the log.
    pub fn from(start: i64) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    /// A window from `start` to `end`.
    pub fn between(start: i64, end: i64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Resolve against a log of `length` entries.
    ///
    /// Both bounds are clamped to `[0, length]`; an inverted window resolves
    /// to an empty one.
    pub fn resolve(&self, length: u64) -> (u64, u64) {
        let bound = |value: i64| -> u64 {
            let absolute = if value < 0 {
                i128::from(length) + i128::from(value)
            } else {
                i128::from(value)
            };
            absolute.clamp(0, i128::from(length)) as u64
        };

        let start = bound(self.start.unwrap_or(0));
        let end = self.end.map_or(length, bound);
        (start, end.max(start))
    }
}

enum Event<E> {
    Bind(SourceEvent<Option<SharedLog<E>>>),
    Window(SourceEvent<Window>),
    Ready(TrackedEntry<Result<(), LogError>>),
    Collected(TrackedEntry<(u64, Vec<E>)>),
}

/// Emits snapshots of an index window of the bound log.
pub struct RangeTracker<E>
where
    E: Clone + Send + Sync + 'static,
{
    output: Node<Vec<E>>,
    driver: Driver,
}

impl<E> RangeTracker<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Snapshot `window` of `log`, re-reading whenever either changes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(log: LogSource<E>, window: Source<Window>) -> Self {
        let output = Node::new();
        let (events, inbox) = mpsc::unbounded_channel();

        let feeds = vec![
            feed_into(&log, &events, Event::Bind),
            feed_into(&window, &events, Event::Window),
        ];
        let state = RangeState {
            binding: ResourceBinding::new(),
            window: window.current().unwrap_or_default(),
            ready: false,
            round: 0,
            readiness: None,
            read: None,
            events,
            output: output.clone(),
            feeds,
        };
        let driver = Driver::spawn(move |shutdown| state.run(inbox, shutdown));

        Self { output, driver }
    }
}

#[async_trait]
impl<E> Tracker for RangeTracker<E>
where
    E: Clone + Send + Sync + 'static,
{
    type Output = Vec<E>;

    fn output(&self) -> &Node<Vec<E>> {
        &self.output
    }

    async fn complete(&self) {
        self.driver.stop().await;
    }
}

struct RangeState<E>
where
    E: Clone + Send + Sync + 'static,
{
    binding: ResourceBinding<E>,
    window: Window,
    ready: bool,
    round: u64,
    readiness: Option<ScopedTask>,
    read: Option<ScopedTask>,
    events: UnboundedSender<Event<E>>,
    output: Node<Vec<E>>,
    feeds: Vec<Subscription>,
}

impl<E> RangeState<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn run(mut self, mut inbox: UnboundedReceiver<Event<E>>, shutdown: CancellationToken) {
        while let Some(event) = next_event(&mut inbox, &shutdown).await {
            if self.handle(event).is_break() {
                break;
            }
        }
        self.teardown();
    }

    fn handle(&mut self, event: Event<E>) -> ControlFlow<()> {
        match event {
            Event::Bind(SourceEvent::Next(log)) => match self.binding.rebind(log) {
                Rebind::Unchanged => {}
                Rebind::Unbound { .. } => self.detach(),
                Rebind::Bound { scope, resource } => {
                    self.detach();
                    self.readiness =
                        Some(await_ready(&scope, &resource, &self.events, Event::Ready));
                }
            },
            Event::Window(SourceEvent::Next(window)) => {
                self.window = window;
                if self.ready {
                    self.recompute();
                }
            }
            Event::Bind(SourceEvent::Error(e)) | Event::Window(SourceEvent::Error(e)) => {
                self.output.error(e);
                return ControlFlow::Break(());
            }
            Event::Bind(SourceEvent::Complete) | Event::Window(SourceEvent::Complete) => {}
            Event::Ready(entry) => match check_ready(&self.binding, entry) {
                ReadyOutcome::Stale => {}
                ReadyOutcome::Ready(_) => {
                    self.readiness = None;
                    self.ready = true;
                    self.recompute();
                }
                ReadyOutcome::Failed(error) => {
                    self.output.error(error);
                    return ControlFlow::Break(());
                }
            },
            Event::Collected(entry) => {
                if !self.binding.accepts(&entry) {
                    trace!(epoch = entry.epoch, "stale range discarded");
                    return ControlFlow::Continue(());
                }
                let (round, entries) = entry.value;
                if round == self.round {
                    self.read = None;
                    self.output.set(entries);
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn detach(&mut self) {
        self.readiness = None;
        self.read = None;
        self.ready = false;
    }

    fn recompute(&mut self) {
        let Some(resource) = self.binding.current().cloned() else {
            return;
        };
        self.round += 1;

        let length = resource.length();
        let (start, end) = self.window.resolve(length);
        debug!(resource = %resource.id(), length, start, end, "reading range");

        let mut stream = resource.create_read_stream(ReadStreamOptions {
            start: Some(start),
            end: Some(end),
            live: false,
        });
        let round = self.round;
        let resource_id = resource.id();
        let events = self.events.clone();
        self.read = Some(self.binding.scope().spawn(
            async move {
                let mut entries = Vec::new();
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(entry) => entries.push(entry),
                        Err(source) => {
                            let error = Error::Stream {
                                resource: resource_id,
                                source,
                            };
                            warn!(%error, collected = entries.len(), "range read ended early");
                            break;
                        }
                    }
                }
                (round, entries)
            },
            move |entry| {
                let _ = events.send(Event::Collected(entry));
            },
        ));
    }

    fn teardown(&mut self) {
        self.detach();
        self.binding.release();
        self.feeds.clear();
        self.output.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_defaults_to_length() {
        assert_eq!(Window::from(2).resolve(6), (2, 6));
        assert_eq!(Window::default().resolve(3), (0, 3));
    }

    #[test]
    fn negative_bounds_count_from_length() {
        assert_eq!(Window::between(-3, -1).resolve(6), (3, 5));
        assert_eq!(Window::between(-3, -1).resolve(10), (7, 9));
    }

    #[test]
    fn bounds_are_clamped() {
        assert_eq!(Window::between(-10, 20).resolve(4), (0, 4));
        assert_eq!(Window::between(3, 1).resolve(4), (3, 3));
        assert_eq!(Window::from(-1).resolve(0), (0, 0));
    }
}
