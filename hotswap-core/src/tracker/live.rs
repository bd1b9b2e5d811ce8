//! Live tail tracking.
//!
//! Republishes every entry appended to the bound log after the tracker
//! attached to it. Each bound resource gets its own tailing read-stream,
//! pumped by a task into the driver's channel.
//!
//! # Hot-swap Policy
//!
//! With `hotswap` on (the default), all open streams are destroyed before a
//! stream on the new resource is opened, so at most one stream is active.
//! With `hotswap` off, streams on superseded resources keep running until
//! the tracker completes; their entries are merged by arrival order.

use std::mem;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    await_ready, check_ready, feed_into, next_event, Driver, LogSource, ReadyOutcome, Tracker,
};
use crate::binding::{Rebind, ResourceBinding, ScopedTask, TrackedEntry};
use crate::error::{Error, LogError};
use crate::log::{ReadStreamOptions, ResourceId, SharedLog};
use crate::reactive::{Node, Source, SourceEvent, Subscription};

/// Options of a [`LiveStreamTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Destroy streams on superseded resources at swap time.
    pub hotswap: bool,
    /// Index to start tailing from. Defaults to the resource's length once
    /// it is ready.
    pub start_length: Option<u64>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            hotswap: true,
            start_length: None,
        }
    }
}

enum Event<E> {
    Bind(SourceEvent<Option<SharedLog<E>>>),
    Config(SourceEvent<LiveConfig>),
    Ready(TrackedEntry<Result<(), LogError>>),
    Entry { stream: u64, entry: E },
    Ended { stream: u64 },
}

/// Streams entries appended to the bound log.
pub struct LiveStreamTracker<E>
where
    E: Clone + Send + Sync + 'static,
{
    output: Node<E>,
    stream_count: Arc<AtomicUsize>,
    driver: Driver,
}

impl<E> LiveStreamTracker<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Tail `log` with hot-swap on.
    pub fn new(log: LogSource<E>) -> Self {
        Self::with_config(log, Source::Static(LiveConfig::default()))
    }

    /// Tail `log` with a static or observed configuration.
    ///
    /// The configuration is read whenever a resource is bound. Must be called
    /// from within a tokio runtime.
    pub fn with_config(log: LogSource<E>, config: Source<LiveConfig>) -> Self {
        let output = Node::new();
        let stream_count = Arc::new(AtomicUsize::new(0));
        let (events, inbox) = mpsc::unbounded_channel();

        let feeds = vec![
            feed_into(&log, &events, Event::Bind),
            feed_into(&config, &events, Event::Config),
        ];
        let state = LiveState {
            binding: ResourceBinding::new(),
            config: config.current().unwrap_or_default(),
            streams: SmallVec::new(),
            next_stream: 0,
            stream_count: Arc::clone(&stream_count),
            readiness: None,
            events,
            output: output.clone(),
            feeds,
        };
        let driver = Driver::spawn(move |shutdown| state.run(inbox, shutdown));

        Self {
            output,
            stream_count,
            driver,
        }
    }

    /// Number of underlying read-streams currently open.
    pub fn stream_count(&self) -> usize {
        self.stream_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<E> Tracker for LiveStreamTracker<E>
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

/// Counts a stream as open for as long as it lives.
struct OpenStream(Arc<AtomicUsize>);

impl OpenStream {
    fn acquire(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One tailing read-stream and the task pumping it.
struct StreamHandle {
    id: u64,
    epoch: u64,
    resource: ResourceId,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// Entries already queued by a stream that ended on its own are still
    /// delivered; only a destroyed stream stops counting as active.
    fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Wait for the pump to drop its stream.
    async fn join(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!(stream = self.id, error = %e, "stream pump panicked");
            }
        }
    }
}

struct LiveState<E>
where
    E: Clone + Send + Sync + 'static,
{
    binding: ResourceBinding<E>,
    config: LiveConfig,
    streams: SmallVec<[StreamHandle; 2]>,
    next_stream: u64,
    stream_count: Arc<AtomicUsize>,
    readiness: Option<ScopedTask>,
    events: UnboundedSender<Event<E>>,
    output: Node<E>,
    feeds: Vec<Subscription>,
}

impl<E> LiveState<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn run(mut self, mut inbox: UnboundedReceiver<Event<E>>, shutdown: CancellationToken) {
        while let Some(event) = next_event(&mut inbox, &shutdown).await {
            if self.handle(event).await.is_break() {
                break;
            }
        }
        self.teardown().await;
    }

    async fn handle(&mut self, event: Event<E>) -> ControlFlow<()> {
        match event {
            Event::Bind(SourceEvent::Next(log)) => self.rebind(log).await,
            Event::Config(SourceEvent::Next(config)) => self.config = config,
            Event::Bind(SourceEvent::Error(e)) | Event::Config(SourceEvent::Error(e)) => {
                self.output.error(e);
                return ControlFlow::Break(());
            }
            Event::Bind(SourceEvent::Complete) | Event::Config(SourceEvent::Complete) => {}
            Event::Ready(entry) => {
                let epoch = entry.epoch;
                match check_ready(&self.binding, entry) {
                    ReadyOutcome::Stale => {}
                    ReadyOutcome::Ready(resource) => {
                        self.readiness = None;
                        self.open(resource, epoch);
                    }
                    ReadyOutcome::Failed(error) => {
                        self.output.error(error);
                        return ControlFlow::Break(());
                    }
                }
            }
            Event::Entry { stream, entry } => {
                if self.streams.iter().any(|h| h.id == stream && h.is_active()) {
                    self.output.set(entry);
                } else {
                    trace!(stream, "entry from destroyed stream dropped");
                }
            }
            Event::Ended { stream } => {
                self.streams.retain(|h| h.id != stream);
            }
        }
        ControlFlow::Continue(())
    }

    async fn rebind(&mut self, log: Option<SharedLog<E>>) {
        match self.binding.rebind(log) {
            Rebind::Unchanged => {}
            Rebind::Unbound { .. } => {
                self.readiness = None;
                if self.config.hotswap {
                    self.destroy_all().await;
                }
            }
            Rebind::Bound { scope, resource } => {
                self.readiness = None;
                if self.config.hotswap {
                    self.destroy_all().await;
                }
                self.readiness = Some(await_ready(&scope, &resource, &self.events, Event::Ready));
            }
        }
    }

    fn open(&mut self, resource: SharedLog<E>, epoch: u64) {
        let start = self
            .config
            .start_length
            .unwrap_or_else(|| resource.length());
        let stream = resource.create_read_stream(ReadStreamOptions {
            start: Some(start),
            end: None,
            live: true,
        });

        let id = self.next_stream;
        self.next_stream += 1;
        let token = CancellationToken::new();
        let open = OpenStream::acquire(&self.stream_count);
        let events = self.events.clone();
        let cancelled = token.clone();
        let resource_id = resource.id();

        let task = tokio::spawn(async move {
            let _open = open;
            let mut stream = stream;
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(entry)) => {
                            if events.send(Event::Entry { stream: id, entry }).is_err() {
                                break;
                            }
                        }
                        Some(Err(source)) => {
                            let error = Error::Stream { resource: resource_id, source };
                            warn!(stream = id, %error, "treating read stream failure as end of stream");
                            break;
                        }
                        None => break,
                    },
                }
            }
            drop(stream);
            let _ = events.send(Event::Ended { stream: id });
        });

        debug!(stream = id, resource = %resource_id, epoch, start, "live stream opened");
        self.streams.push(StreamHandle {
            id,
            epoch,
            resource: resource_id,
            token,
            task,
        });
    }

    /// Destroy every open stream and wait until each has been dropped.
    async fn destroy_all(&mut self) {
        let streams = mem::take(&mut self.streams);
        for handle in &streams {
            handle.token.cancel();
        }
        for handle in streams {
            debug!(
                stream = handle.id,
                resource = %handle.resource,
                epoch = handle.epoch,
                "live stream destroyed"
            );
            handle.join().await;
        }
    }

    async fn teardown(&mut self) {
        self.readiness = None;
        self.destroy_all().await;
        self.binding.release();
        self.feeds.clear();
        self.output.complete();
    }
}
