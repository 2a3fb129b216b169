//! Worker pool driving a [`Reconciler`] from the work queue
//!
//! Each worker loops: take a key, run one sync under the sync deadline, then
//! decide from the error class whether the key is forgotten, requeued with
//! backoff, or dropped. The queue guarantees a key is held by at most one
//! worker, so syncs of the same key never overlap.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keel_common::error::UNKNOWN_CONTEXT;
use keel_common::{ControllerConfig, Error};

use crate::object::ObjectKey;
use crate::queue::WorkQueue;
use crate::rate_limiter::default_controller_rate_limiter;

/// Brings the world in line with one controller object
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name used for the queue and in logs
    fn name(&self) -> &str;

    /// Reconcile the object identified by `key`
    ///
    /// Must be idempotent: the same key is synced again after any change to
    /// the object or its children, and after failures.
    async fn sync(&self, ctx: &SyncContext, key: &ObjectKey) -> keel_common::Result<()>;
}

/// Cancellation and deadline of one sync
#[derive(Clone, Debug)]
pub struct SyncContext {
    cancel: CancellationToken,
    deadline: Instant,
}

impl SyncContext {
    /// Context expiring after `timeout` or when `cancel` fires
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
        }
    }

    /// Shutdown signal for this sync
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Instant at which the sync gives up
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether shutdown has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut`, bounded by cancellation and the deadline
    pub async fn run<F, T>(&self, context: &str, fut: F) -> keel_common::Result<T>
    where
        F: Future<Output = keel_common::Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::cancelled(context)),
            _ = tokio::time::sleep_until(self.deadline) => Err(Error::deadline_exceeded(context)),
            result = fut => result,
        }
    }
}

/// Marks the key done when the worker lets go of it, including on panic
struct InFlight {
    queue: WorkQueue<ObjectKey>,
    key: ObjectKey,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}

/// A reconciler together with its work queue
pub struct Controller<R> {
    reconciler: Arc<R>,
    queue: WorkQueue<ObjectKey>,
    config: ControllerConfig,
}

impl<R> Clone for Controller<R> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            queue: self.queue.clone(),
            config: self.config.clone(),
        }
    }
}

impl<R: Reconciler> Controller<R> {
    /// Create a controller with a queue rate limited per `config`
    pub fn new(reconciler: Arc<R>, config: ControllerConfig) -> Self {
        let queue = WorkQueue::new(
            reconciler.name().to_string(),
            default_controller_rate_limiter(&config),
        );
        Self {
            reconciler,
            queue,
            config,
        }
    }

    /// Queue feeding the workers; event handlers enqueue keys here
    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Run `workers` workers until `shutdown` fires
    ///
    /// Returns once every worker has stopped; queued work is then discarded.
    pub async fn run(&self, workers: usize, shutdown: CancellationToken) {
        let name = self.reconciler.name().to_string();
        info!(controller = %name, workers, "Starting controller");

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let controller = self.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move {
                while controller.process_next_item(&shutdown).await {}
                debug!(controller = %controller.reconciler.name(), worker, "Worker stopped");
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(controller = %name, error = %e, "Worker panicked, continuing with fewer workers");
                } else {
                    warn!(controller = %name, error = %e, "Worker ended unexpectedly");
                }
            }
        }

        self.queue.shut_down();
        info!(controller = %name, "Controller stopped");
    }

    /// Take one key and sync it; `false` once the worker should stop
    async fn process_next_item(&self, shutdown: &CancellationToken) -> bool {
        let key = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return false,
            key = self.queue.get() => match key {
                Some(key) => key,
                None => return false,
            },
        };
        let _in_flight = InFlight {
            queue: self.queue.clone(),
            key: key.clone(),
        };

        let started = Instant::now();
        debug!(controller = %self.reconciler.name(), %key, "Started syncing");

        let ctx = SyncContext::new(shutdown.child_token(), self.config.max_sync_duration);
        let result = ctx
            .run(&format!("sync {key}"), self.reconciler.sync(&ctx, &key))
            .await;

        debug!(
            controller = %self.reconciler.name(),
            %key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished syncing"
        );
        self.handle_result(&key, result);
        true
    }

    fn handle_result(&self, key: &ObjectKey, result: keel_common::Result<()>) {
        let controller = self.reconciler.name();
        match result {
            Ok(()) => self.queue.forget(key),
            Err(e) if e.is_conflict() || e.is_already_exists() => {
                debug!(%controller, %key, error = %e, "Hit a conflict, will retry in a bit");
                self.queue.add_rate_limited(key.clone());
            }
            Err(e) if e.is_non_retriable() => {
                info!(%controller, %key, error = %e, "Hit a non-retriable error, dropping the key");
                self.queue.forget(key);
            }
            Err(e) if e.is_timeout() => {
                let stage = e.context().unwrap_or(UNKNOWN_CONTEXT);
                if matches!(e, Error::Cancelled { .. }) {
                    debug!(%controller, %key, stage, "Sync interrupted by shutdown");
                } else {
                    warn!(%controller, %key, stage, "Sync exceeded its deadline, requeueing");
                }
                self.queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                error!(%controller, %key, error = %e, "Sync failed, requeueing");
                self.queue.add_rate_limited(key.clone());
            }
        }
    }
}
