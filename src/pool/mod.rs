//! Bounded, recyclable pool of engine contexts.
//!
//! Every request flows through two gates:
//!
//! - an admission semaphore with `admission_limit` permits bounding how many
//!   requests are past submission at once, independent of pool capacity;
//! - a mutex over the worker bookkeeping that decides which worker is free
//!   and whether the pool must recycle. Engine calls never run under it.
//!
//! Waiting for a free worker, for a drain before recycling, and for a drain
//! during teardown are all event driven through one [`Notify`], signalled
//! whenever a worker is returned or the worker set changes.
//!
//! When the aggregate execution count reaches `recycle_threshold`, new
//! selections wait until every in-flight call has finished; the first
//! waiter to observe the idle pool destroys and recreates every context and
//! resets the counters. The counters drop back below the threshold, so one
//! crossing yields one recycle.

pub mod worker;

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore, TryAcquireError, oneshot};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::engine::{ComputeEngine, EngineError, InferenceOptions};
use self::worker::{Context, Worker, WorkerId};

/// Default model shipped with the library indexer.
pub const DEFAULT_MODEL_PATH: &str = "models/discogs_track_embeddings-effnet-bs64-1.pb";

/// Errors surfaced by the pool itself. Engine failures during inference are
/// never returned; they become an empty embedding.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,

    #[error("request backlog is full")]
    Backlogged,

    #[error("worker pool has no workers")]
    NoWorkers,

    #[error("no worker became available within {0:?}")]
    AcquireTimeout(Duration),

    #[error("worker slot {slot} failed to start: {source}")]
    Configuration {
        slot: usize,
        #[source]
        source: EngineError,
    },

    #[error("invalid pool settings: {0}")]
    InvalidSettings(String),

    #[error("request was dropped before completing")]
    Dropped,
}

/// Runtime settings for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of workers (and contexts) the pool holds.
    pub capacity: usize,
    /// Permits of the admission semaphore. May differ from `capacity`: with
    /// more permits than workers, admitted requests queue for a worker.
    pub admission_limit: usize,
    /// Aggregate executions after which every context is recreated.
    pub recycle_threshold: u64,
    /// Requests that may be waiting for admission or still computing.
    pub max_backlog: usize,
    /// Give up waiting for a worker after this long. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    pub model_path: PathBuf,
    pub inference: InferenceOptions,
}

impl Default for PoolSettings {
    fn default() -> Self {
        const DEFAULT_INSTANCES: usize = 10;
        Self {
            capacity: DEFAULT_INSTANCES,
            admission_limit: DEFAULT_INSTANCES,
            recycle_threshold: DEFAULT_INSTANCES as u64 * 4,
            max_backlog: 256,
            acquire_timeout: None,
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            inference: InferenceOptions::default(),
        }
    }
}

impl PoolSettings {
    pub fn validate(&self) -> Result<(), PoolError> {
        let invalid = |msg: &str| Err(PoolError::InvalidSettings(msg.to_string()));
        if self.capacity == 0 {
            return invalid("capacity must be positive");
        }
        if self.admission_limit == 0 {
            return invalid("admission_limit must be positive");
        }
        if self.recycle_threshold == 0 {
            return invalid("recycle_threshold must be positive");
        }
        if self.max_backlog < self.admission_limit {
            return invalid("max_backlog must be at least admission_limit");
        }
        if self.max_backlog > Semaphore::MAX_PERMITS {
            return invalid("max_backlog is too large");
        }
        Ok(())
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub available: bool,
    pub executions: u64,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub workers: usize,
    pub available: usize,
    pub busy: usize,
    pub total_executions: u64,
    pub recycles: u64,
    pub recycling: bool,
    pub worker_status: Vec<WorkerStatus>,
}

struct PoolState<E: ComputeEngine> {
    workers: BTreeMap<WorkerId, Worker<E>>,
    recycling: bool,
    /// Completed recycles; the recycle epoch.
    recycles: u64,
    closed: bool,
}

impl<E: ComputeEngine> PoolState<E> {
    fn total_executions(&self) -> u64 {
        self.workers.values().map(|w| w.executions).sum()
    }

    fn all_idle(&self) -> bool {
        !self.recycling && self.workers.values().all(|w| w.available)
    }

    fn claim_first(&mut self) -> Option<Lease<E>> {
        self.workers.values_mut().find_map(|w| {
            w.claim().map(|context| Lease {
                worker: w.id,
                context,
            })
        })
    }
}

/// A claimed worker's context, owned by exactly one in-flight call.
struct Lease<E: ComputeEngine> {
    worker: WorkerId,
    context: Context<E>,
}

struct Shared<E: ComputeEngine> {
    engine: Arc<E>,
    settings: PoolSettings,
    state: Mutex<PoolState<E>>,
    changed: Notify,
    next_id: AtomicU64,
}

impl<E: ComputeEngine> Shared<E> {
    // Bookkeeping is never left half-updated, so a poisoned lock is usable.
    fn lock(&self) -> MutexGuard<'_, PoolState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_worker_id(&self) -> WorkerId {
        WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Select a free worker, recycling first if the threshold was reached.
    async fn checkout(&self) -> Result<Lease<E>, PoolError> {
        let deadline = self.settings.acquire_timeout.map(|t| Instant::now() + t);

        loop {
            // Register interest before inspecting state so a release between
            // the check and the await is not missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let retired = {
                let mut state = self.lock();
                if state.recycling {
                    None
                } else if state.workers.is_empty() {
                    return Err(PoolError::NoWorkers);
                } else if state.total_executions() >= self.settings.recycle_threshold {
                    if state.all_idle() {
                        state.recycling = true;
                        let retired: Vec<_> = state
                            .workers
                            .values_mut()
                            .filter_map(|w| w.retire().map(|c| (w.id, c)))
                            .collect();
                        Some(retired)
                    } else {
                        debug!("Recycle pending, waiting for in-flight calls to finish");
                        None
                    }
                } else if let Some(lease) = state.claim_first() {
                    trace!(worker = %lease.worker, "Worker claimed");
                    return Ok(lease);
                } else {
                    None
                }
            };

            if let Some(retired) = retired {
                self.recycle(retired).await;
                continue;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(PoolError::AcquireTimeout(
                            self.settings.acquire_timeout.unwrap_or_default(),
                        ));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Destroy every retired context and open a fresh one per worker.
    async fn recycle(&self, retired: Vec<(WorkerId, Context<E>)>) {
        info!(
            workers = retired.len(),
            threshold = self.settings.recycle_threshold,
            "Recycling contexts to bound native memory"
        );

        let engine = Arc::clone(&self.engine);
        let model_path = self.settings.model_path.clone();
        let fresh = tokio::task::spawn_blocking(move || {
            retired
                .into_iter()
                .map(|(id, old)| {
                    drop(old);
                    (id, Context::open(Arc::clone(&engine), &model_path))
                })
                .collect::<Vec<_>>()
        })
        .await;

        let (recycles, remaining) = {
            let mut state = self.lock();
            match fresh {
                Ok(fresh) => {
                    for (id, result) in fresh {
                        match result {
                            Ok(context) => {
                                if let Some(worker) = state.workers.get_mut(&id) {
                                    worker.install(context);
                                }
                            }
                            Err(e) => {
                                error!(worker = %id, error = %e, "Failed to recreate context, removing worker");
                            }
                        }
                    }
                }
                Err(e) => error!(error = %e, "Recycle task failed"),
            }
            // Workers whose context could not be recreated leave the pool.
            state.workers.retain(|_, w| w.has_context());
            state.recycles += 1;
            state.recycling = false;
            (state.recycles, state.workers.len())
        };

        info!(recycles, workers = remaining, "Recycle complete");
        self.changed.notify_waiters();
    }

    /// Return a context to its worker and count the execution.
    fn release(&self, worker: WorkerId, context: Context<E>) {
        {
            let mut state = self.lock();
            match state.workers.get_mut(&worker) {
                Some(w) => {
                    w.restore(context);
                    trace!(worker = %worker, executions = w.executions, "Worker released");
                }
                None => warn!(worker = %worker, "Released worker is no longer in the pool"),
            }
        }
        self.changed.notify_waiters();
    }

    /// Drop a worker whose context was lost.
    fn discard(&self, worker: WorkerId) {
        self.lock().workers.remove(&worker);
        self.changed.notify_waiters();
    }

    async fn infer(&self, lease: Lease<E>, file: &Path) -> Vec<f32> {
        let Lease {
            worker,
            mut context,
        } = lease;
        let options = self.settings.inference;
        let path = file.to_path_buf();

        let joined = tokio::task::spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| context.infer(&path, options)));
            (context, result)
        })
        .await;

        let (context, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!(worker = %worker, file = %file.display(), error = %e, "Inference task lost its context");
                self.discard(worker);
                return Vec::new();
            }
        };
        self.release(worker, context);

        let outcome = result.unwrap_or_else(|payload| {
            Err(EngineError::Panicked(panic_message(&*payload)))
        });
        match outcome {
            Ok(embedding) => {
                debug!(worker = %worker, file = %file.display(), dimensions = embedding.len(), "Got embeddings");
                embedding
            }
            Err(e) => {
                warn!(worker = %worker, file = %file.display(), error = %e, "Getting embeddings failed");
                Vec::new()
            }
        }
    }

    /// Select a worker and run the engine; failures become an empty vector.
    async fn compute(&self, file: &Path) -> Vec<f32> {
        match self.checkout().await {
            Ok(lease) => self.infer(lease, file).await,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "No worker for request");
                Vec::new()
            }
        }
    }

    async fn wait_until_idle(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle = self.lock().all_idle();
            if idle {
                return;
            }
            notified.await;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Pool of engine contexts shared by every embedding request.
///
/// Cloning is cheap; clones share the same workers.
pub struct WorkerPool<E: ComputeEngine> {
    shared: Arc<Shared<E>>,
    admission: Arc<Semaphore>,
    backlog: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl<E: ComputeEngine> Clone for WorkerPool<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            admission: Arc::clone(&self.admission),
            backlog: Arc::clone(&self.backlog),
            tracker: self.tracker.clone(),
        }
    }
}

impl<E: ComputeEngine> WorkerPool<E> {
    /// Create an empty pool. Call [`WorkerPool::create_workers`] to fill it.
    pub fn new(engine: Arc<E>, settings: PoolSettings) -> Result<Self, PoolError> {
        settings.validate()?;

        if settings.admission_limit != settings.capacity {
            info!(
                capacity = settings.capacity,
                admission_limit = settings.admission_limit,
                "Admission limit differs from pool capacity"
            );
        }

        Ok(Self {
            admission: Arc::new(Semaphore::new(settings.admission_limit)),
            backlog: Arc::new(Semaphore::new(settings.max_backlog)),
            tracker: TaskTracker::new(),
            shared: Arc::new(Shared {
                engine,
                settings,
                state: Mutex::new(PoolState {
                    workers: BTreeMap::new(),
                    recycling: false,
                    recycles: 0,
                    closed: false,
                }),
                changed: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    /// Fill the pool up to capacity. Blocking; returns the number of workers
    /// added, zero when the pool is already full.
    ///
    /// Fails fast: if any context cannot be configured, every context opened
    /// by this call is destroyed and the error is returned.
    pub fn create_workers(&self) -> Result<usize, PoolError> {
        let shared = &self.shared;
        let capacity = shared.settings.capacity;

        let existing = {
            let state = shared.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.workers.len()
        };
        let missing = capacity.saturating_sub(existing);
        if missing == 0 {
            return Ok(0);
        }

        let mut opened = Vec::with_capacity(missing);
        for offset in 0..missing {
            let slot = existing + offset;
            let context = Context::open(Arc::clone(&shared.engine), &shared.settings.model_path)
                .map_err(|source| {
                    error!(slot, error = %source, "Failed to start worker");
                    PoolError::Configuration { slot, source }
                })?;
            opened.push(context);
        }

        let added = {
            let mut state = shared.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            // A concurrent call may have filled some slots meanwhile; the
            // surplus contexts are destroyed when `opened` drops.
            let room = capacity.saturating_sub(state.workers.len());
            let mut added = 0;
            for context in opened.into_iter().take(room) {
                let id = shared.next_worker_id();
                state.workers.insert(id, Worker::new(id, context));
                added += 1;
            }
            added
        };

        info!(added, capacity, "Workers created");
        shared.changed.notify_waiters();
        Ok(added)
    }

    /// Submit `file` for embedding.
    ///
    /// Waits only for an admission ticket; the work itself runs on a separate
    /// task and `on_complete` receives the embedding, or an empty vector if
    /// the engine failed. When this returns `Ok`, `on_complete` fires exactly
    /// once. When it returns `Err` (`Closed` or `Backlogged`), it never fires.
    pub async fn get_embeddings<F, Fut>(
        &self,
        file: impl Into<PathBuf>,
        on_complete: F,
    ) -> Result<(), PoolError>
    where
        F: FnOnce(Vec<f32>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let closed = self.shared.lock().closed;
        if closed {
            return Err(PoolError::Closed);
        }

        let queued = Arc::clone(&self.backlog)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => PoolError::Closed,
                TryAcquireError::NoPermits => PoolError::Backlogged,
            })?;
        // Keeps teardown's drain waiting while this request sits in admission.
        let token = self.tracker.token();
        let ticket = Arc::clone(&self.admission)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let file = file.into();
        trace!(file = %file.display(), "Request admitted");
        let shared = Arc::clone(&self.shared);
        self.tracker.spawn(async move {
            let embedding = shared.compute(&file).await;
            // Leave the backlog before the callback so a caller woken by it
            // can submit again straight away.
            drop(queued);
            on_complete(embedding).await;
            drop(ticket);
        });
        drop(token);
        Ok(())
    }

    /// Embed `file` and wait for the result.
    pub async fn embed(&self, file: impl Into<PathBuf>) -> Result<Vec<f32>, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.get_embeddings(file, move |embedding| async move {
            let _ = tx.send(embedding);
        })
        .await?;
        rx.await.map_err(|_| PoolError::Dropped)
    }

    /// Stop accepting requests, wait for every in-flight call, then destroy
    /// every context.
    ///
    /// Requests still waiting for admission are rejected with
    /// [`PoolError::Closed`]. The pool cannot be reused afterwards.
    pub async fn teardown_workers(&self) {
        self.shared.lock().closed = true;
        self.admission.close();
        self.backlog.close();
        self.tracker.close();

        self.tracker.wait().await;
        self.shared.wait_until_idle().await;

        let workers = std::mem::take(&mut self.shared.lock().workers);
        let count = workers.len();
        if count > 0 {
            // Context drops call into the engine; keep them off the runtime.
            if let Err(e) = tokio::task::spawn_blocking(move || drop(workers)).await {
                error!(error = %e, "Context teardown task failed");
            }
        }

        info!(contexts = count, "Worker pool torn down");
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let worker_status: Vec<WorkerStatus> = state
            .workers
            .values()
            .map(|w| WorkerStatus {
                id: w.id,
                available: w.available,
                executions: w.executions,
            })
            .collect();
        let available = worker_status.iter().filter(|w| w.available).count();

        PoolStats {
            capacity: self.shared.settings.capacity,
            workers: worker_status.len(),
            available,
            busy: worker_status.len() - available,
            total_executions: state.total_executions(),
            recycles: state.recycles,
            recycling: state.recycling,
            worker_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;

    #[test]
    fn test_default_settings() {
        let settings = PoolSettings::default();
        assert_eq!(settings.capacity, 10);
        assert_eq!(settings.admission_limit, 10);
        assert_eq!(settings.recycle_threshold, 40);
        assert!(settings.acquire_timeout.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let settings = PoolSettings {
            capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(PoolError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_validate_rejects_small_backlog() {
        let settings = PoolSettings {
            admission_limit: 8,
            max_backlog: 4,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
    }

    #[test]
    fn test_create_workers_is_idempotent() {
        let engine = Arc::new(MockEngine::new(8));
        let pool = WorkerPool::new(
            Arc::clone(&engine),
            PoolSettings {
                capacity: 3,
                admission_limit: 3,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(pool.create_workers().unwrap(), 3);
        assert_eq!(pool.create_workers().unwrap(), 0);

        let stats = pool.stats();
        assert_eq!(stats.workers, 3);
        assert_eq!(stats.available, 3);
        assert_eq!(stats.total_executions, 0);
        assert_eq!(engine.stats().created, 3);
    }

    #[test]
    fn test_create_workers_fails_fast() {
        let engine = Arc::new(MockEngine::new(8));
        let pool = WorkerPool::new(
            Arc::clone(&engine),
            PoolSettings {
                capacity: 4,
                admission_limit: 4,
                ..Default::default()
            },
        )
        .unwrap();

        engine.fail_model_load_after(2);

        let err = pool.create_workers().unwrap_err();
        assert!(matches!(err, PoolError::Configuration { slot: 2, .. }));
        assert_eq!(pool.stats().workers, 0);

        let stats = engine.stats();
        assert_eq!(stats.live, 0, "no context may leak from a failed start");
        assert_eq!(stats.created, stats.destroyed);
    }
}
