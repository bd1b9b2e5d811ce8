//! Managed Resources
//!
//! A [`ManagedResourceFactory`] turns a (possibly changing) [`Locator`] into
//! an open log resource and owns every resource it opened.
//!
//! # How Resolution Works
//!
//! 1. Each configuration value is resolved to a [`StoreKey`]. A locator that
//!    is not exactly one of name or key is ignored.
//!
//! 2. The store hands over the resource, which is recorded in the created
//!    set right away. From then on the factory is responsible for closing it.
//!
//! 3. Once the resource is ready, the previous one is closed if it differs
//!    and hot-swap is on. Then the new one is emitted.
//!
//! Resolutions are handled one at a time, in arrival order. A configuration
//! arriving while the current resource is still pending supersedes it: the
//! pending resource is never emitted but stays in the created set. Completing
//! the factory closes everything still in the created set, each exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::log::{Locator, LogStore, ResourceId, SharedLog};
use crate::reactive::{Node, Source, SourceEvent, Subscription};
use crate::tracker::{feed_into, next_event, Driver, LogSource, Tracker};

/// Configuration of a [`ManagedResourceFactory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Which resource to open.
    pub locator: Locator,
    /// Close the previous resource when a different one is emitted.
    pub hotswap: bool,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            locator: Locator::default(),
            hotswap: true,
        }
    }
}

impl FactoryConfig {
    /// Open `locator` with hot-swap on.
    pub fn new(locator: Locator) -> Self {
        Self {
            locator,
            ..Self::default()
        }
    }
}

type Created<E> = Arc<Mutex<IndexMap<ResourceId, SharedLog<E>>>>;

/// Opens log resources from a store and closes them when superseded or on
/// termination.
pub struct ManagedResourceFactory<E>
where
    E: Clone + Send + Sync + 'static,
{
    output: Node<Option<SharedLog<E>>>,
    created: Created<E>,
    driver: Driver,
}

impl<E> ManagedResourceFactory<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Resolve `config` against `store`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn LogStore<Entry = E>>, config: Source<FactoryConfig>) -> Self {
        let output = Node::new();
        let created: Created<E> = Arc::new(Mutex::new(IndexMap::new()));
        let (events, inbox) = mpsc::unbounded_channel::<SourceEvent<FactoryConfig>>();

        let feed = feed_into(&config, &events, |event| event);
        let state = FactoryState {
            store,
            created: Arc::clone(&created),
            last: None,
            output: output.clone(),
            feed: Some(feed),
        };
        let driver = Driver::spawn(move |shutdown| state.run(inbox, shutdown));

        Self {
            output,
            created,
            driver,
        }
    }

    /// The factory's output as the log reference of a tracker.
    pub fn log_source(&self) -> LogSource<E> {
        Source::Observed(self.output.clone())
    }

    /// Number of resources opened and not yet closed.
    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Whether `id` was opened by this factory and is not yet closed.
    pub fn is_tracking(&self, id: ResourceId) -> bool {
        self.created.lock().contains_key(&id)
    }
}

#[async_trait]
impl<E> Tracker for ManagedResourceFactory<E>
where
    E: Clone + Send + Sync + 'static,
{
    type Output = Option<SharedLog<E>>;

    fn output(&self) -> &Node<Option<SharedLog<E>>> {
        &self.output
    }

    async fn complete(&self) {
        self.driver.stop().await;
    }
}

/// How a resolution ended.
enum Step {
    Settled,
    /// A newer configuration arrived while the resource was pending.
    Superseded(SourceEvent<FactoryConfig>),
    Shutdown,
}

struct FactoryState<E>
where
    E: Clone + Send + Sync + 'static,
{
    store: Arc<dyn LogStore<Entry = E>>,
    created: Created<E>,
    /// The resource emitted most recently.
    last: Option<SharedLog<E>>,
    output: Node<Option<SharedLog<E>>>,
    feed: Option<Subscription>,
}

impl<E> FactoryState<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn run(
        mut self,
        mut inbox: UnboundedReceiver<SourceEvent<FactoryConfig>>,
        shutdown: CancellationToken,
    ) {
        let mut next = None;
        loop {
            let event = match next.take() {
                Some(event) => event,
                None => match next_event(&mut inbox, &shutdown).await {
                    Some(event) => event,
                    // A static configuration has no more values to send.
                    None if !shutdown.is_cancelled() => {
                        shutdown.cancelled().await;
                        break;
                    }
                    None => break,
                },
            };
            let outcome = match event {
                SourceEvent::Next(config) => self.resolve(config, &mut inbox, &shutdown).await,
                SourceEvent::Error(e) => Err(e),
                SourceEvent::Complete => Ok(Step::Settled),
            };
            match outcome {
                Ok(Step::Settled) => {}
                Ok(Step::Superseded(event)) => next = Some(event),
                Ok(Step::Shutdown) => break,
                Err(e) => {
                    debug!(error = %e, "factory terminated");
                    self.output.error(e);
                    break;
                }
            }
        }
        self.teardown().await;
    }

    async fn resolve(
        &mut self,
        config: FactoryConfig,
        inbox: &mut UnboundedReceiver<SourceEvent<FactoryConfig>>,
        shutdown: &CancellationToken,
    ) -> Result<Step, Error> {
        let key = match config.locator.resolve() {
            Ok(key) => key,
            Err(e) => {
                debug!(error = %e, "ignoring locator");
                return Ok(Step::Settled);
            }
        };

        let resource = self.store.get(&key).map_err(Error::Store)?;
        let id = resource.id();
        self.created.lock().insert(id, resource.clone());
        debug!(%key, resource = %id, "resource opened");

        // A pending resource stays in the created set when abandoned and is
        // closed on termination.
        let mut ready = resource.ready();
        let mut inbox_open = true;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(Step::Shutdown),
                event = inbox.recv(), if inbox_open => match event {
                    Some(SourceEvent::Complete) => {}
                    Some(event) => {
                        debug!(resource = %id, "pending resource superseded");
                        return Ok(Step::Superseded(event));
                    }
                    None => inbox_open = false,
                },
                result = &mut ready => {
                    result.map_err(|source| Error::ResourceReady {
                        resource: id,
                        source,
                    })?;
                    break;
                }
            }
        }
        drop(ready);

        if let Some(previous) = self.last.clone() {
            if previous.id() == id {
                trace!(resource = %id, "locator resolved to the emitted resource");
                return Ok(Step::Settled);
            }
            if config.hotswap {
                self.created.lock().shift_remove(&previous.id());
                previous.close().await.map_err(|source| Error::Close {
                    resource: previous.id(),
                    source,
                })?;
                debug!(resource = %previous.id(), "superseded resource closed");
            }
        }

        self.last = Some(resource.clone());
        self.output.set(Some(resource));
        Ok(Step::Settled)
    }

    async fn teardown(&mut self) {
        self.feed = None;
        self.last = None;

        let created: Vec<SharedLog<E>> =
            self.created.lock().drain(..).map(|(_, log)| log).collect();
        for resource in created {
            match resource.close().await {
                Ok(()) => debug!(resource = %resource.id(), "resource closed"),
                Err(e) => warn!(resource = %resource.id(), error = %e, "failed to close resource"),
            }
        }
        self.output.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: FactoryConfig =
            serde_json::from_str(r#"{"locator": {"name": "orders"}}"#).unwrap();
        assert_eq!(config, FactoryConfig::new(Locator::name("orders")));
        assert!(config.hotswap);

        let config: FactoryConfig =
            serde_json::from_str(r#"{"locator": {"key": [1, 2]}, "hotswap": false}"#).unwrap();
        assert_eq!(config.locator, Locator::key(vec![1, 2]));
        assert!(!config.hotswap);
    }
}
