//! The `Reconciler` trait and the generic `Controller` that drives it.

use crate::config::ControllerConfig;
use crate::error::{ErrorCategory, ReconcileError};
use crate::metrics::{ControllerMetrics, ReconcileResult};
use crate::queue::WorkQueue;
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What the controller should do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged; wait for the next change event or resync.
    Done,
    /// Call again after the delay.
    RequeueAfter(Duration),
}

/// Brings the resource behind a key toward its desired state.
///
/// Implementations must be idempotent: the controller may call `reconcile`
/// any number of times for the same key, including after a crash.
///
/// # Example
///
/// ```rust,ignore
/// #[async_trait]
/// impl Reconciler<ObjectKey> for DeliveryReconciler {
///     async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
///         let request = self.store.get(key).await?;
///         /* ... */
///         Ok(Action::Done)
///     }
///
///     fn name(&self) -> &'static str {
///         "delivery"
///     }
/// }
/// ```
#[async_trait]
pub trait Reconciler<K>: Send + Sync {
    async fn reconcile(&self, key: &K) -> Result<Action, ReconcileError>;

    fn name(&self) -> &'static str;
}

/// Runs a bounded pool of workers that pull keys from a [`WorkQueue`] and
/// pass them to a [`Reconciler`].
pub struct Controller<K, R> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<K>>,
    config: ControllerConfig,
    metrics: ControllerMetrics,
    failures: Arc<Mutex<HashMap<K, u32>>>,
}

impl<K, R> Controller<K, R>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    R: Reconciler<K> + 'static,
{
    pub fn new(reconciler: R, config: ControllerConfig) -> Self {
        Self::with_arc_reconciler(Arc::new(reconciler), config)
    }

    pub fn with_arc_reconciler(reconciler: Arc<R>, config: ControllerConfig) -> Self {
        let metrics = ControllerMetrics::new(config.name.clone());
        Self {
            reconciler,
            queue: Arc::new(WorkQueue::new()),
            config,
            metrics,
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handle used by event sources to enqueue keys.
    pub fn queue(&self) -> Arc<WorkQueue<K>> {
        Arc::clone(&self.queue)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// On shutdown the queue stops handing out keys and in-flight reconciles
    /// are allowed to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            controller = %self.config.name,
            reconciler = %self.reconciler.name(),
            workers = %self.config.max_concurrent_reconciles,
            reconcile_timeout_secs = %self.config.reconcile_timeout.as_secs(),
            "Starting controller"
        );

        let busy = Arc::new(AtomicUsize::new(0));
        let mut workers: JoinSet<()> = JoinSet::new();

        let mut next_id = 0;
        for _ in 0..self.config.max_concurrent_reconciles {
            self.spawn_worker(next_id, &busy, &mut workers);
            next_id += 1;
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                joined = workers.join_next() => {
                    match joined {
                        Some(Err(e)) => {
                            error!(
                                controller = %self.config.name,
                                error = %e,
                                "Worker task died, replacing it"
                            );
                            self.spawn_worker(next_id, &busy, &mut workers);
                            next_id += 1;
                        }
                        Some(Ok(())) => {}
                        None => break,
                    }
                }
            }
        }

        info!(controller = %self.config.name, "Shutdown requested, draining workers");
        self.queue.shut_down();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(controller = %self.config.name, error = %e, "Worker task panicked");
            }
        }
        info!(controller = %self.config.name, "Controller stopped");
    }
}

impl<K, R> Controller<K, R>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    R: Reconciler<K> + 'static,
{
    fn spawn_worker(&self, id: usize, busy: &Arc<AtomicUsize>, workers: &mut JoinSet<()>) {
        let worker = Worker {
            id,
            reconciler: Arc::clone(&self.reconciler),
            queue: Arc::clone(&self.queue),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            failures: Arc::clone(&self.failures),
            busy: Arc::clone(busy),
        };
        workers.spawn(worker.run());
    }
}

struct Worker<K, R> {
    id: usize,
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<K>>,
    config: ControllerConfig,
    metrics: ControllerMetrics,
    failures: Arc<Mutex<HashMap<K, u32>>>,
    busy: Arc<AtomicUsize>,
}

impl<K, R> Worker<K, R>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    R: Reconciler<K> + 'static,
{
    async fn run(self) {
        debug!(controller = %self.config.name, worker = self.id, "Worker started");

        while let Some(key) = self.queue.get().await {
            let current = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
            self.metrics.workers_busy(current);

            self.process(&key).await;
            self.queue.done(&key);

            let current = self.busy.fetch_sub(1, Ordering::SeqCst) - 1;
            self.metrics.workers_busy(current);
            self.metrics
                .queue_depth(self.queue.len(), self.queue.delayed_len());
        }

        debug!(controller = %self.config.name, worker = self.id, "Worker stopped");
    }

    /// One reconcile in its own task, so a panic costs the key a backoff
    /// instead of costing the pool a worker.
    async fn invoke(&self, key: &K) -> Result<Action, ReconcileError> {
        let reconciler = Arc::clone(&self.reconciler);
        let owned = key.clone();
        let timeout = self.config.reconcile_timeout;

        let task = tokio::spawn(async move {
            tokio::time::timeout(timeout, reconciler.reconcile(&owned)).await
        });

        match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ReconcileError::Timeout(timeout)),
            Err(e) if e.is_panic() => {
                Err(ReconcileError::Panicked(panic_message(e.into_panic())))
            }
            Err(e) => Err(ReconcileError::transient(format!(
                "reconcile task cancelled: {e}"
            ))),
        }
    }

    async fn process(&self, key: &K) {
        let start = Instant::now();
        let outcome = self.invoke(key).await;

        match outcome {
            Ok(Action::Done) => {
                self.forget(key);
                self.metrics.reconciled(ReconcileResult::Done, start.elapsed());
                debug!(controller = %self.config.name, key = ?key, "Reconciled");
            }
            Ok(Action::RequeueAfter(delay)) => {
                self.forget(key);
                self.metrics
                    .reconciled(ReconcileResult::Requeue, start.elapsed());
                self.metrics.requeued("requested");
                debug!(
                    controller = %self.config.name,
                    key = ?key,
                    delay_ms = delay.as_millis() as u64,
                    "Reconciled, requeue requested"
                );
                self.queue.add_after(key.clone(), delay);
            }
            Err(e) => match e.category() {
                ErrorCategory::Transient => {
                    let failures = self.record_failure(key);
                    let delay = ErrorCategory::Transient.backoff_delay(
                        failures - 1,
                        self.config.error_backoff_base,
                        self.config.error_backoff_max,
                    );
                    self.metrics
                        .reconciled(ReconcileResult::TransientError, start.elapsed());
                    self.metrics.requeued("backoff");
                    warn!(
                        controller = %self.config.name,
                        key = ?key,
                        error = %e,
                        failures,
                        backoff_ms = delay.as_millis() as u64,
                        "Reconcile failed, backing off"
                    );
                    self.queue.add_after(key.clone(), delay);
                }
                ErrorCategory::Permanent => {
                    self.forget(key);
                    self.metrics
                        .reconciled(ReconcileResult::PermanentError, start.elapsed());
                    error!(
                        controller = %self.config.name,
                        key = ?key,
                        error = %e,
                        "Reconcile failed permanently, dropping key"
                    );
                }
            },
        }
    }

    fn record_failure(&self, key: &K) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn forget(&self, key: &K) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
