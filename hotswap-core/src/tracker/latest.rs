//! Latest-entry tracking.
//!
//! Follows the entry at `length + offset` of the bound log. The index is
//! recomputed against the live length on every append notification, so an
//! offset of `-1` always tracks the newest entry.

use std::ops::ControlFlow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    await_ready, check_ready, feed_into, next_event, notify_into, Driver, LogSource, ReadyOutcome,
    Tracker,
};
use crate::binding::{Rebind, ResourceBinding, ScopedTask, TrackedEntry};
use crate::error::{Error, LogError};
use crate::log::{GetOptions, SharedLog};
use crate::reactive::{Node, Source, SourceEvent, Subscription, Tracked};

/// Which entry a [`LatestValueTracker`] follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatestConfig {
    /// Negative: relative to the live length (`-1` is the last entry).
    /// Non-negative: an absolute index.
    pub offset: i64,
    /// Passed to `get`. The tracker re-reads on append, so it does not wait
    /// by default.
    pub wait: bool,
}

impl Default for LatestConfig {
    fn default() -> Self {
        Self {
            offset: -1,
            wait: false,
        }
    }
}

impl LatestConfig {
    /// Follow `offset` with the default options.
    pub fn offset(offset: i64) -> Self {
        Self {
            offset,
            ..Self::default()
        }
    }

    /// Resolve the index to fetch for a log of `length` entries.
    pub fn resolve_index(&self, length: u64) -> Tracked<u64> {
        if length == 0 {
            return Tracked::Skip;
        }
        if self.offset >= 0 {
            return Tracked::Value(self.offset as u64);
        }
        let index = i128::from(length) + i128::from(self.offset);
        match u64::try_from(index) {
            Ok(index) => Tracked::Value(index),
            Err(_) => Tracked::Skip,
        }
    }
}

enum Event<E> {
    Bind(SourceEvent<Option<SharedLog<E>>>),
    Config(SourceEvent<LatestConfig>),
    Ready(TrackedEntry<Result<(), LogError>>),
    Append { epoch: u64 },
    Closed { epoch: u64 },
    Fetched(TrackedEntry<(u64, Result<Option<E>, LogError>)>),
}

/// Tracks the entry at `length + offset` of the bound log.
pub struct LatestValueTracker<E>
where
    E: Clone + Send + Sync + 'static,
{
    output: Node<E>,
    driver: Driver,
}

impl<E> LatestValueTracker<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Track the last entry of `log`.
    pub fn new(log: LogSource<E>) -> Self {
        Self::with_config(log, Source::Static(LatestConfig::default()))
    }

    /// Track `log` with a static or observed configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_config(log: LogSource<E>, config: Source<LatestConfig>) -> Self {
        let output = Node::new();
        let (events, inbox) = mpsc::unbounded_channel();

        let feeds = vec![
            feed_into(&log, &events, Event::Bind),
            feed_into(&config, &events, Event::Config),
        ];
        let state = LatestState {
            binding: ResourceBinding::new(),
            config: config.current().unwrap_or_default(),
            ready: false,
            round: 0,
            listeners: SmallVec::new(),
            readiness: None,
            fetch: None,
            events,
            output: output.clone(),
            feeds,
        };
        let driver = Driver::spawn(move |shutdown| state.run(inbox, shutdown));

        Self { output, driver }
    }
}

#[async_trait]
impl<E> Tracker for LatestValueTracker<E>
where
    E: Clone + Send + Sync + 'static,
{
    type Output = E;

    fn output(&self) -> &Node<E> {
        &self.output
    }

    async fn complete(&self) {
        self.driver.stop().await;
    }
}

struct LatestState<E>
where
    E: Clone + Send + Sync + 'static,
{
    binding: ResourceBinding<E>,
    config: LatestConfig,
    /// Whether the current epoch's resource reported ready.
    ready: bool,
    /// Incremented per refresh; only the newest fetch may emit.
    round: u64,
    /// Append and close notifications of the current epoch.
    listeners: SmallVec<[Subscription; 2]>,
    readiness: Option<ScopedTask>,
    fetch: Option<ScopedTask>,
    events: UnboundedSender<Event<E>>,
    output: Node<E>,
    feeds: Vec<Subscription>,
}

impl<E> LatestState<E>
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
            Event::Bind(SourceEvent::Next(log)) => self.rebind(log),
            Event::Config(SourceEvent::Next(config)) => {
                self.config = config;
                if self.ready {
                    self.refresh();
                }
            }
            Event::Bind(SourceEvent::Error(e)) | Event::Config(SourceEvent::Error(e)) => {
                self.output.error(e);
                return ControlFlow::Break(());
            }
            Event::Bind(SourceEvent::Complete) | Event::Config(SourceEvent::Complete) => {}
            Event::Ready(entry) => match check_ready(&self.binding, entry) {
                ReadyOutcome::Stale => {}
                ReadyOutcome::Ready(_) => {
                    self.readiness = None;
                    self.ready = true;
                    self.refresh();
                }
                ReadyOutcome::Failed(error) => {
                    self.output.error(error);
                    return ControlFlow::Break(());
                }
            },
            Event::Append { epoch } => {
                if self.ready && self.binding.is_current(epoch) {
                    self.refresh();
                }
            }
            Event::Closed { epoch } => {
                if self.binding.is_current(epoch) {
                    debug!(epoch, "bound log closed, no longer following appends");
                    self.listeners.clear();
                }
            }
            Event::Fetched(entry) => self.deliver(entry),
        }
        ControlFlow::Continue(())
    }

    fn rebind(&mut self, log: Option<SharedLog<E>>) {
        match self.binding.rebind(log) {
            Rebind::Unchanged => {}
            Rebind::Unbound { .. } => self.detach(),
            Rebind::Bound { scope, resource } => {
                self.detach();

                let epoch = scope.epoch();
                self.listeners.push(
                    resource.on_append(notify_into(&self.events, move || Event::Append { epoch })),
                );
                self.listeners.push(
                    resource.on_close(notify_into(&self.events, move || Event::Closed { epoch })),
                );
                self.readiness = Some(await_ready(&scope, &resource, &self.events, Event::Ready));
            }
        }
    }

    /// Drop everything tied to the previous epoch.
    fn detach(&mut self) {
        self.listeners.clear();
        self.readiness = None;
        self.fetch = None;
        self.ready = false;
    }

    /// The resource and index the next fetch should read.
    fn target(&self) -> Tracked<(SharedLog<E>, u64)> {
        match self.binding.current() {
            None => Tracked::Unbound,
            Some(resource) => self
                .config
                .resolve_index(resource.length())
                .map(|index| (resource.clone(), index)),
        }
    }

    fn refresh(&mut self) {
        self.round += 1;
        self.fetch = None;

        let (resource, index) = match self.target() {
            Tracked::Value(target) => target,
            Tracked::Skip => {
                trace!(offset = self.config.offset, "no entry to track yet");
                return;
            }
            Tracked::Unbound => {
                trace!(error = %Error::BindingUnavailable, "refresh skipped");
                return;
            }
        };

        let round = self.round;
        let opts = GetOptions {
            wait: self.config.wait,
        };
        let events = self.events.clone();
        self.fetch = Some(self.binding.scope().spawn(
            async move { (round, resource.get(index, opts).await) },
            move |entry| {
                let _ = events.send(Event::Fetched(entry));
            },
        ));
    }

    fn deliver(&mut self, entry: TrackedEntry<(u64, Result<Option<E>, LogError>)>) {
        if !self.binding.accepts(&entry) {
            trace!(epoch = entry.epoch, "stale fetch discarded");
            return;
        }
        let (round, result) = entry.value;
        if round != self.round {
            trace!(round, "superseded fetch discarded");
            return;
        }
        self.fetch = None;

        let tracked = match result {
            Ok(value) => Tracked::from(value),
            Err(e) => {
                debug!(error = %e, "fetch failed, skipping this round");
                Tracked::Skip
            }
        };
        if let Some(value) = tracked.into_value() {
            self.output.set(value);
        }
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
    fn negative_offsets_follow_length() {
        let last = LatestConfig::default();
        assert_eq!(last.resolve_index(0), Tracked::Skip);
        assert_eq!(last.resolve_index(1), Tracked::Value(0));
        assert_eq!(last.resolve_index(5), Tracked::Value(4));

        let second_last = LatestConfig::offset(-2);
        assert_eq!(second_last.resolve_index(1), Tracked::Skip);
        assert_eq!(second_last.resolve_index(2), Tracked::Value(0));
    }

    #[test]
    fn non_negative_offsets_are_absolute() {
        let third = LatestConfig::offset(2);
        assert_eq!(third.resolve_index(0), Tracked::Skip);
        assert_eq!(third.resolve_index(1), Tracked::Value(2));
        assert_eq!(third.resolve_index(10), Tracked::Value(2));
    }

    #[test]
    fn config_defaults_when_fields_are_missing() {
        let config: LatestConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LatestConfig::default());

        let config: LatestConfig = serde_json::from_str(r#"{"offset": -3}"#).unwrap();
        assert_eq!(config.offset, -3);
        assert!(!config.wait);
    }
}
