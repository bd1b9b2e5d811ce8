//! Fixed-index tracking.

use std::ops::ControlFlow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    await_ready, check_ready, feed_into, next_event, Driver, LogSource, ReadyOutcome, Tracker,
};
use crate::binding::{Rebind, ResourceBinding, ScopedTask, TrackedEntry};
use crate::error::LogError;
use crate::log::{GetOptions, SharedLog};
use crate::reactive::{Node, Source, SourceEvent, Subscription, Tracked};

/// Which entry a [`HeadTracker`] reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    /// Absolute index of the entry to read.
    pub index: u64,
    /// Keep the fetch pending until the entry exists.
    pub wait: bool,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            index: 0,
            wait: true,
        }
    }
}

enum Event<E> {
    Bind(SourceEvent<Option<SharedLog<E>>>),
    Config(SourceEvent<HeadConfig>),
    Ready(TrackedEntry<Result<(), LogError>>),
    Fetched(TrackedEntry<(u64, Result<Option<E>, LogError>)>),
}

/// Emits the entry at a fixed index of the bound log.
pub struct HeadTracker<E>
where
    E: Clone + Send + Sync + 'static,
{
    output: Node<E>,
    driver: Driver,
}

impl<E> HeadTracker<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Read the first entry of `log`, waiting for it if needed.
    pub fn new(log: LogSource<E>) -> Self {
        Self::with_config(log, Source::Static(HeadConfig::default()))
    }

    /// Read the entry `config` selects, refetching when it changes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_config(log: LogSource<E>, config: Source<HeadConfig>) -> Self {
        let output = Node::new();
        let (events, inbox) = mpsc::unbounded_channel();

        let feeds = vec![
            feed_into(&log, &events, Event::Bind),
            feed_into(&config, &events, Event::Config),
        ];
        let state = HeadState {
            binding: ResourceBinding::new(),
            config: config.current().unwrap_or_default(),
            ready: false,
            round: 0,
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
impl<E> Tracker for HeadTracker<E>
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

struct HeadState<E>
where
    E: Clone + Send + Sync + 'static,
{
    binding: ResourceBinding<E>,
    config: HeadConfig,
    ready: bool,
    round: u64,
    readiness: Option<ScopedTask>,
    fetch: Option<ScopedTask>,
    events: UnboundedSender<Event<E>>,
    output: Node<E>,
    feeds: Vec<Subscription>,
}

impl<E> HeadState<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn run(mut self, mut inbox: UnboundedReceiver<Event<E>>, shutdown: CancellationToken) {
        while let Some(event) = next_event(&mut inbox, &shutdown).await {
            if self.handle(event).is_break() {
                break;
            }
        }
        self.readiness = None;
        self.fetch = None;
        self.binding.release();
        self.feeds.clear();
        self.output.complete();
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
            Event::Config(SourceEvent::Next(config)) => {
                let changed = config != self.config;
                self.config = config;
                if changed && self.ready {
                    self.fetch();
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
                    self.fetch();
                }
                ReadyOutcome::Failed(error) => {
                    self.output.error(error);
                    return ControlFlow::Break(());
                }
            },
            Event::Fetched(entry) => {
                if !self.binding.accepts(&entry) {
                    trace!(epoch = entry.epoch, "stale fetch discarded");
                    return ControlFlow::Continue(());
                }
                let (round, result) = entry.value;
                if round != self.round {
                    return ControlFlow::Continue(());
                }
                self.fetch = None;
                let tracked = result.map(Tracked::from).unwrap_or_else(|e| {
                    debug!(index = self.config.index, error = %e, "head fetch failed");
                    Tracked::Skip
                });
                if let Some(value) = tracked.into_value() {
                    self.output.set(value);
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn detach(&mut self) {
        self.readiness = None;
        self.fetch = None;
        self.ready = false;
    }

    fn fetch(&mut self) {
        let Some(resource) = self.binding.current().cloned() else {
            return;
        };
        self.round += 1;

        let round = self.round;
        let index = self.config.index;
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
}
