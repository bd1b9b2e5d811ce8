//! In-memory log resources and store.
//!
//! Useful for tests and for composition roots that run without persistence.
//! [`MemoryLog`] also exposes counters (listeners, open streams, close calls)
//! so leak and teardown behaviour can be asserted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::debug;

use super::{
    EntryStream, GetOptions, LogResource, LogStore, Notify, ReadStreamOptions, ResourceId,
    SharedLog, StoreKey,
};
use crate::error::LogError;
use crate::reactive::{Listeners, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct LogState {
    length: u64,
    closed: bool,
    readiness: Readiness,
}

struct LogInner<E> {
    id: ResourceId,
    entries: RwLock<Vec<E>>,
    state: watch::Sender<LogState>,
    ready_error: Mutex<Option<LogError>>,
    close_error: Mutex<Option<LogError>>,
    append_listeners: Listeners<dyn Fn() + Send + Sync>,
    close_listeners: Listeners<dyn Fn() + Send + Sync>,
    close_calls: AtomicUsize,
    open_streams: Arc<AtomicUsize>,
}

impl<E: Clone> LogInner<E> {
    fn entry(&self, index: u64) -> Option<E> {
        let index = usize::try_from(index).ok()?;
        self.entries.read().get(index).cloned()
    }

    fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

/// An append-only log held in memory.
///
/// Cloning yields another handle to the same resource (same [`ResourceId`]).
pub struct MemoryLog<E> {
    inner: Arc<LogInner<E>>,
}

impl<E> MemoryLog<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty log that is ready immediately.
    pub fn new() -> Self {
        Self::with_readiness(Readiness::Ready)
    }

    /// Create an empty log whose `ready()` stays pending until [`open`].
    ///
    /// [`open`]: MemoryLog::open
    pub fn pending() -> Self {
        Self::with_readiness(Readiness::Pending)
    }

    fn with_readiness(readiness: Readiness) -> Self {
        let (state, _) = watch::channel(LogState {
            length: 0,
            closed: false,
            readiness,
        });
        Self {
            inner: Arc::new(LogInner {
                id: ResourceId::new(),
                entries: RwLock::new(Vec::new()),
                state,
                ready_error: Mutex::new(None),
                close_error: Mutex::new(None),
                append_listeners: Listeners::new(),
                close_listeners: Listeners::new(),
                close_calls: AtomicUsize::new(0),
                open_streams: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Create a ready log holding `entries`.
    pub fn from_entries(entries: impl IntoIterator<Item = E>) -> Self {
        let log = Self::new();
        let collected: Vec<E> = entries.into_iter().collect();
        let length = collected.len() as u64;
        *log.inner.entries.write() = collected;
        log.inner.state.send_modify(|state| state.length = length);
        log
    }

    /// Resolve a pending `ready()`.
    pub fn open(&self) {
        self.inner.state.send_modify(|state| {
            if state.readiness == Readiness::Pending {
                state.readiness = Readiness::Ready;
            }
        });
    }

    /// Make `ready()` fail with `error`, now and from then on.
    pub fn fail_ready(&self, error: LogError) {
        *self.inner.ready_error.lock() = Some(error);
        self.inner
            .state
            .send_modify(|state| state.readiness = Readiness::Failed);
    }

    /// Make the next `close()` fail with `error` without closing.
    pub fn fail_close(&self, error: LogError) {
        *self.inner.close_error.lock() = Some(error);
    }

    /// Append one entry and return its index.
    pub fn append(&self, entry: E) -> Result<u64, LogError> {
        self.extend([entry]).map(|length| length - 1)
    }

    /// Append several entries with a single notification.
    ///
    /// Returns the new length.
    pub fn extend(&self, entries: impl IntoIterator<Item = E>) -> Result<u64, LogError> {
        if self.inner.is_closed() {
            return Err(LogError::Closed);
        }

        let length = {
            let mut guard = self.inner.entries.write();
            guard.extend(entries);
            let length = guard.len() as u64;
            // Under the guard: the published length never decreases.
            self.inner.state.send_modify(|state| state.length = length);
            length
        };

        for notify in self.inner.append_listeners.snapshot() {
            notify();
        }
        Ok(length)
    }

    /// Number of registered append notifications.
    pub fn append_listener_count(&self) -> usize {
        self.inner.append_listeners.len()
    }

    /// Number of registered close notifications.
    pub fn close_listener_count(&self) -> usize {
        self.inner.close_listeners.len()
    }

    /// Number of read-streams currently alive.
    pub fn open_stream_count(&self) -> usize {
        self.inner.open_streams.load(Ordering::SeqCst)
    }

    /// Number of times `close()` was called.
    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    /// Share this log as a trait object.
    pub fn shared(&self) -> SharedLog<E> {
        Arc::new(self.clone())
    }
}

impl<E> Default for MemoryLog<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for MemoryLog<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Decrements the open stream counter when a read-stream is dropped.
struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Cursor<E> {
    log: Arc<LogInner<E>>,
    changes: watch::Receiver<LogState>,
    next: u64,
    end: Option<u64>,
    live: bool,
    done: bool,
    _guard: StreamGuard,
}

#[async_trait]
impl<E> LogResource for MemoryLog<E>
where
    E: Clone + Send + Sync + 'static,
{
    type Entry = E;

    fn id(&self) -> ResourceId {
        self.inner.id
    }

    async fn ready(&self) -> Result<(), LogError> {
        let mut changes = self.inner.state.subscribe();
        let state = changes
            .wait_for(|state| state.closed || state.readiness != Readiness::Pending)
            .await
            .map(|state| *state)
            .map_err(|_| LogError::Closed)?;

        if state.closed {
            return Err(LogError::Closed);
        }
        match state.readiness {
            Readiness::Failed => Err(self
                .inner
                .ready_error
                .lock()
                .clone()
                .unwrap_or_else(|| LogError::ReadyFailed("unknown".into()))),
            Readiness::Ready | Readiness::Pending => Ok(()),
        }
    }

    fn length(&self) -> u64 {
        self.inner.state.borrow().length
    }

    async fn get(&self, index: u64, opts: GetOptions) -> Result<Option<E>, LogError> {
        let mut changes = self.inner.state.subscribe();
        loop {
            if self.inner.is_closed() {
                return Err(LogError::Closed);
            }
            if let Some(entry) = self.inner.entry(index) {
                return Ok(Some(entry));
            }
            if !opts.wait {
                return Ok(None);
            }
            let settled = changes
                .wait_for(|state| state.closed || state.length > index)
                .await
                .is_ok();
            if !settled {
                return Err(LogError::Closed);
            }
        }
    }

    fn create_read_stream(&self, opts: ReadStreamOptions) -> EntryStream<E> {
        let end = if opts.live {
            opts.end
        } else {
            Some(opts.end.unwrap_or_else(|| self.length()))
        };
        let cursor = Cursor {
            log: Arc::clone(&self.inner),
            changes: self.inner.state.subscribe(),
            next: opts.start.unwrap_or(0),
            end,
            live: opts.live,
            done: false,
            _guard: StreamGuard::acquire(&self.inner.open_streams),
        };

        stream::unfold(cursor, |mut cursor| async move {
            loop {
                if cursor.done {
                    return None;
                }
                if cursor.end.is_some_and(|end| cursor.next >= end) {
                    return None;
                }
                if cursor.log.is_closed() {
                    cursor.done = true;
                    return Some((Err(LogError::Closed), cursor));
                }
                if let Some(entry) = cursor.log.entry(cursor.next) {
                    cursor.next += 1;
                    return Some((Ok(entry), cursor));
                }
                if !cursor.live {
                    return None;
                }

                let next = cursor.next;
                let alive = cursor
                    .changes
                    .wait_for(|state| state.closed || state.length > next)
                    .await
                    .is_ok();
                if !alive {
                    return None;
                }
            }
        })
        .boxed()
    }

    fn on_append(&self, notify: Notify) -> Subscription {
        self.inner.append_listeners.insert(notify)
    }

    fn on_close(&self, notify: Notify) -> Subscription {
        if self.inner.is_closed() {
            notify();
            return Subscription::empty();
        }
        self.inner.close_listeners.insert(notify)
    }

    async fn close(&self) -> Result<(), LogError> {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.inner.close_error.lock().take() {
            return Err(error);
        }

        let mut newly_closed = false;
        self.inner.state.send_modify(|state| {
            newly_closed = !state.closed;
            state.closed = true;
        });
        if newly_closed {
            debug!(resource = %self.inner.id, "memory log closed");
            for notify in self.inner.close_listeners.drain() {
                notify();
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// A keyed store of [`MemoryLog`]s.
///
/// A key maps to the same log while it is open; once closed, the next
/// lookup creates a fresh one.
pub struct MemoryStore<E> {
    logs: DashMap<StoreKey, MemoryLog<E>>,
    opened: AtomicUsize,
    lookup_error: Mutex<Option<LogError>>,
}

impl<E> MemoryStore<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            logs: DashMap::new(),
            opened: AtomicUsize::new(0),
            lookup_error: Mutex::new(None),
        }
    }

    /// Get the log currently held for `key`, without creating one.
    pub fn log(&self, key: &StoreKey) -> Option<MemoryLog<E>> {
        self.logs.get(key).map(|entry| entry.value().clone())
    }

    /// Number of logs this store has created.
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Make every following lookup fail with `error`.
    pub fn fail_lookups(&self, error: LogError) {
        *self.lookup_error.lock() = Some(error);
    }
}

impl<E> Default for MemoryStore<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E> LogStore for MemoryStore<E>
where
    E: Clone + Send + Sync + 'static,
{
    type Entry = E;

    fn get(&self, key: &StoreKey) -> Result<SharedLog<E>, LogError> {
        if let Some(error) = self.lookup_error.lock().clone() {
            return Err(error);
        }

        let mut entry = self.logs.entry(key.clone()).or_insert_with(|| {
            self.opened.fetch_add(1, Ordering::SeqCst);
            MemoryLog::new()
        });
        if entry.is_closed() {
            self.opened.fetch_add(1, Ordering::SeqCst);
            *entry = MemoryLog::new();
        }
        debug!(%key, resource = %entry.id(), "memory store lookup");
        Ok(entry.value().shared())
    }

    async fn close(&self) -> Result<(), LogError> {
        let logs: Vec<MemoryLog<E>> = self.logs.iter().map(|entry| entry.value().clone()).collect();
        for log in logs {
            log.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    #[tokio::test]
    async fn append_grows_length_and_notifies() {
        let log = MemoryLog::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let subscription = log.on_append(Arc::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(log.append("a"), Ok(0));
        assert_eq!(log.extend(["b", "c"]), Ok(3));
        assert_eq!(log.length(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        subscription.unsubscribe();
        assert_eq!(log.append_listener_count(), 0);
    }

    #[tokio::test]
    async fn get_without_wait_returns_none_past_the_end() {
        let log = MemoryLog::from_entries([1, 2]);
        assert_eq!(log.get(1, GetOptions::no_wait()).await, Ok(Some(2)));
        assert_eq!(log.get(2, GetOptions::no_wait()).await, Ok(None));
    }

    #[tokio::test]
    async fn get_with_wait_resolves_on_append() {
        let log = MemoryLog::new();
        let reader = log.clone();
        let pending = tokio::spawn(async move { reader.get(0, GetOptions::default()).await });

        tokio::task::yield_now().await;
        log.append(9).unwrap();
        assert_eq!(pending.await.unwrap(), Ok(Some(9)));
    }

    #[tokio::test]
    async fn bounded_stream_reads_window() {
        let log = MemoryLog::from_entries(0..6);
        let entries: Vec<i32> = log
            .create_read_stream(ReadStreamOptions {
                start: Some(2),
                end: Some(5),
                live: false,
            })
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entries, vec![2, 3, 4]);
        assert_eq!(log.open_stream_count(), 0);
    }

    #[tokio::test]
    async fn live_stream_tails_and_errors_on_close() {
        let log = MemoryLog::from_entries([1]);
        let mut stream = log.create_read_stream(ReadStreamOptions {
            start: Some(1),
            end: None,
            live: true,
        });
        assert_eq!(log.open_stream_count(), 1);

        log.append(2).unwrap();
        assert_eq!(stream.next().await, Some(Ok(2)));

        log.close().await.unwrap();
        assert_eq!(stream.next().await, Some(Err(LogError::Closed)));
        assert_eq!(stream.next().await, None);

        drop(stream);
        assert_eq!(log.open_stream_count(), 0);
    }

    #[tokio::test]
    async fn pending_log_becomes_ready_on_open() {
        let log: MemoryLog<u8> = MemoryLog::pending();
        let waiter = log.clone();
        let ready = tokio::spawn(async move { waiter.ready().await });

        tokio::task::yield_now().await;
        assert!(!ready.is_finished());

        log.open();
        assert_eq!(ready.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn ready_failure_is_reported() {
        let log: MemoryLog<u8> = MemoryLog::new();
        log.fail_ready(LogError::ReadyFailed("disk gone".into()));
        assert_eq!(
            log.ready().await,
            Err(LogError::ReadyFailed("disk gone".into()))
        );
    }

    #[tokio::test]
    async fn close_fires_once() {
        let log: MemoryLog<u8> = MemoryLog::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let _sub = log.on_close(Arc::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        log.close().await.unwrap();
        log.close().await.unwrap();

        assert!(log.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(log.close_calls(), 2);
        assert_eq!(log.append(1), Err(LogError::Closed));
    }

    #[test]
    fn length_never_moves_backwards_under_concurrent_appends() {
        let log: MemoryLog<u32> = MemoryLog::new();
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        log.append(i).unwrap();
                    }
                })
            })
            .collect();

        let mut last = 0;
        while last < 2000 {
            let length = log.length();
            assert!(length >= last, "length went from {last} to {length}");
            last = length;
        }
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(log.length(), 2000);
    }

    #[tokio::test]
    async fn store_returns_same_identity_per_key() {
        let store: MemoryStore<u8> = MemoryStore::new();
        let key = StoreKey::Name("feed".into());

        let first = store.get(&key).unwrap();
        let again = store.get(&key).unwrap();
        assert_eq!(first.id(), again.id());

        let other = store.get(&StoreKey::Name("other".into())).unwrap();
        assert_ne!(first.id(), other.id());
        assert_eq!(store.opened_count(), 2);

        first.close().await.unwrap();
        let reopened = store.get(&key).unwrap();
        assert_ne!(first.id(), reopened.id());
        assert_eq!(store.opened_count(), 3);
    }
}
