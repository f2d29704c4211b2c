//! Event-driven reconciler runtime (spec.md §4.K): watches an
//! [`ObjectStore`] for one record type, dispatches each observed key through
//! an ordered handler chain, dedups while a key is already in flight, and
//! honors a handler's `retryAfter` without losing the event.
//!
//! This generic runtime backs the declarative-record router spec.md §4.K
//! describes: one instance per control-plane record type (`ServerRecord`,
//! `CatalogEntry`, `ModelAccessPolicy`). The second router §4.K names —
//! against the MCP workload cluster's own watch feed, copying deployment
//! status back onto `E_srv` (§4.F) — watches Kubernetes `Deployment`
//! objects directly rather than an [`ObjectStore`], so it is not an
//! instantiation of this type; see `deploy::watch_workload_status`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Semaphore};
use tracing::{info, warn};

use crate::error::Result;
use crate::model::ObjectKey;
use crate::store::{HasMeta, ObjectStore, WatchEvent};

/// A handler's verdict for one record (spec.md §4.K).
pub enum HandlerOutcome {
    Done,
    /// Re-enqueue this key without marking the current pass "done".
    RetryAfter(Duration),
}

#[async_trait::async_trait]
pub trait ReconcileHandler<T>: Send + Sync {
    async fn handle(&self, key: &ObjectKey, item: &T) -> Result<HandlerOutcome>;

    /// Label attached to this handler's audit-log events (spec.md §10).
    /// Defaults to the handler's type name; override for a shorter label.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Leader election status, checked before every handler-chain pass. A single
/// replica drives writes; followers still watch (keeping `cached` warm) but
/// never invoke handlers (spec.md §4.K, §5).
pub trait LeaderElector: Send + Sync {
    fn is_leader(&self) -> bool;
}

pub struct SingleProcessLeader;
impl LeaderElector for SingleProcessLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

/// Fixed backoff used when a handler returns an error rather than an
/// explicit `retryAfter` — the runtime still must not drop the event.
const ERROR_RETRY_BACKOFF: Duration = Duration::from_millis(50);

pub struct ReconcilerRuntime<T>
where
    T: HasMeta + Clone + Send + Sync + 'static,
{
    store: Arc<dyn ObjectStore<T>>,
    handlers: Vec<Arc<dyn ReconcileHandler<T>>>,
    leader: Arc<dyn LeaderElector>,
    cache: DashMap<ObjectKey, T>,
    in_flight: DashMap<ObjectKey, ()>,
    pending: DashMap<ObjectKey, T>,
    semaphore: Arc<Semaphore>,
}

impl<T> ReconcilerRuntime<T>
where
    T: HasMeta + Clone + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<dyn ObjectStore<T>>,
        handlers: Vec<Arc<dyn ReconcileHandler<T>>>,
        leader: Arc<dyn LeaderElector>,
        worker_count: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            handlers,
            leader,
            cache: DashMap::new(),
            in_flight: DashMap::new(),
            pending: DashMap::new(),
            semaphore: Arc::new(Semaphore::new(worker_count.max(1))),
        })
    }

    /// The newest observed state for `key`, kept warm regardless of
    /// leadership.
    pub fn cached(&self, key: &ObjectKey) -> Option<T> {
        self.cache.get(key).map(|entry| entry.value().clone())
    }

    /// Number of keys currently being reconciled or queued behind an
    /// in-flight pass, exposed via `/metrics` (`SPEC_FULL.md` §10).
    pub fn queue_depth(&self) -> usize {
        self.in_flight.len() + self.pending.len()
    }

    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    /// Submit one observed event. If `key` is already being reconciled, the
    /// new state replaces whatever was pending and no second pass is
    /// spawned — the in-flight pass picks it up when it loops (spec.md §4.K
    /// "the newest observed state is reconciled at most once per outstanding
    /// enqueue").
    pub fn submit(self: &Arc<Self>, key: ObjectKey, item: T) {
        self.cache.insert(key.clone(), item.clone());
        if self.in_flight.insert(key.clone(), ()).is_some() {
            self.pending.insert(key, item);
            return;
        }
        let runtime = Arc::clone(self);
        tokio::spawn(async move { runtime.drain(key, item).await });
    }

    async fn drain(self: Arc<Self>, key: ObjectKey, mut item: T) {
        loop {
            if self.leader.is_leader() {
                let outcome = {
                    let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
                    self.run_handlers(&key, &item).await
                };
                match outcome {
                    Ok(Some(delay)) => {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(key = ?key, error = %err, "reconcile handler chain failed, will retry");
                        tokio::time::sleep(ERROR_RETRY_BACKOFF).await;
                    }
                }
            }

            match self.pending.remove(&key) {
                Some((_, newer)) => {
                    item = newer;
                    continue;
                }
                None => {
                    self.in_flight.remove(&key);
                    break;
                }
            }
        }
    }

    /// Handlers run serially in declaration order for a single key (spec.md
    /// §5 "the handler chain observes events in the order the store
    /// delivers them"). The first `RetryAfter` halts the chain for this pass.
    async fn run_handlers(&self, key: &ObjectKey, item: &T) -> Result<Option<Duration>> {
        for handler in &self.handlers {
            match handler.handle(key, item).await {
                Ok(HandlerOutcome::Done) => {
                    info!(key = ?key, handler = handler.name(), outcome = "applied", "reconcile handler invocation");
                }
                Ok(HandlerOutcome::RetryAfter(delay)) => {
                    info!(
                        key = ?key,
                        handler = handler.name(),
                        outcome = "retried",
                        delay_ms = delay.as_millis() as u64,
                        "reconcile handler invocation"
                    );
                    return Ok(Some(delay));
                }
                Err(err) => {
                    info!(key = ?key, handler = handler.name(), outcome = "no-op", error = %err, "reconcile handler invocation");
                    return Err(err);
                }
            }
        }
        Ok(None)
    }

    /// Drive the runtime from the adapter's watch feed (spec.md §4.A/§4.K).
    /// Runs until the channel closes.
    pub async fn run_watch_loop(self: Arc<Self>) {
        let mut rx = self.store.watch();
        loop {
            match rx.recv().await {
                Ok(WatchEvent::Added(item)) | Ok(WatchEvent::Modified(item)) => {
                    let key = ObjectKey::from(item.meta());
                    self.submit(key, item);
                }
                Ok(WatchEvent::Deleted(item)) => {
                    self.cache.remove(&ObjectKey::from(item.meta()));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Type-erased view over a `ReconcilerRuntime<T>` for the `/metrics` debug
/// endpoint (`SPEC_FULL.md` §10), which reports across every record type
/// without being generic itself.
pub trait ReconcilerMetricsSource: Send + Sync {
    fn record_kind(&self) -> &'static str;
    fn queue_depth(&self) -> usize;
    fn is_leader(&self) -> bool;
}

impl<T> ReconcilerMetricsSource for ReconcilerRuntime<T>
where
    T: HasMeta + Clone + Send + Sync + 'static,
{
    fn record_kind(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn queue_depth(&self) -> usize {
        ReconcilerRuntime::queue_depth(self)
    }

    fn is_leader(&self) -> bool {
        ReconcilerRuntime::is_leader(self)
    }
}
