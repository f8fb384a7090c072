/**
 * Controller over one resource collection
 *
 * Binds a watch source, the store, the work queue and a worker pool to a
 * `Reconciler`. Events from the watch source are applied to the store and
 * enqueued by a single ingestion task; workers pull keys and reconcile them
 * with bounded, backed-off retries.
 */
use super::backoff::BackoffPolicy;
use super::queue::WorkQueue;
use super::reconcile::{self, Reconciler, SyncOutcome, panic_error};
use super::watch::WatchSource;
use super::{Controller, ControllerError, ControllerState};
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::k8s::cache::config::{ERROR_CHANNEL_CAPACITY, INGEST_CHANNEL_CAPACITY};
use crate::k8s::cache::{Store, object_key};
use crate::k8s::{ResourceApi, ResourceEvent};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use kube::Resource;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct ResourceController<K>
where
    K: Send + Sync + 'static,
{
    config: ControllerConfig,
    api: Arc<dyn ResourceApi<K>>,
    reconciler: Arc<dyn Reconciler<K>>,
    cache: Arc<Store<K>>,
    queue: Arc<WorkQueue>,
    stop: CancellationToken,
    state_tx: watch::Sender<ControllerState>,
    errors_tx: mpsc::Sender<ControllerError>,
    errors_rx: Mutex<Option<mpsc::Receiver<ControllerError>>>,
}

impl<K> ResourceController<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Build a controller from its configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid
    pub fn new(
        mut config: ControllerConfig,
        api: Arc<dyn ResourceApi<K>>,
        reconciler: Arc<dyn Reconciler<K>>,
    ) -> Result<Self> {
        config.apply_defaults();
        config.validate()?;

        let backoff = BackoffPolicy::new(config.backoff_base(), config.backoff_max());
        let (state_tx, _) = watch::channel(ControllerState::Created);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            api,
            reconciler,
            cache: Arc::new(Store::new()),
            queue: WorkQueue::new(backoff),
            stop: CancellationToken::new(),
            state_tx,
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<Store<K>> {
        &self.cache
    }

    #[must_use]
    pub const fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    fn set_state(&self, state: ControllerState) {
        self.state_tx.send_replace(state);
    }

    /// Cancel every task of this controller and refuse further work
    fn signal_stop(&self) {
        self.stop.cancel();
        self.queue.shut_down();
    }

    fn report(&self, err: ControllerError) {
        if let Err(e) = self.errors_tx.try_send(err) {
            warn!(controller = %self.config.name, "⚠️  Error channel unavailable, dropping error: {}", e.into_inner());
        }
    }

    async fn run_source(self: Arc<Self>, events: mpsc::Sender<ResourceEvent<K>>) {
        let source = WatchSource::new(
            self.config.name.clone(),
            self.api.clone(),
            self.config.mode,
            self.config.poll_interval(),
        )
        .with_restart_policy(
            BackoffPolicy::new(self.config.watch_backoff_base(), self.config.watch_backoff_max()),
            self.config.max_watch_restarts,
        );

        if let Err(source) = source.run(events, self.stop.clone()).await {
            self.report(ControllerError::WatchFailed {
                controller: self.config.name.clone(),
                source,
            });
            self.signal_stop();
        }
    }

    /// Apply watch events to the store and enqueue the affected keys
    async fn ingest(self: Arc<Self>, mut events: mpsc::Receiver<ResourceEvent<K>>) {
        while let Some(event) = events.recv().await {
            match event {
                ResourceEvent::Restarted(objects) => {
                    for key in self.cache.replace(objects).await {
                        self.queue.add(key);
                    }
                }
                ResourceEvent::Added(obj) | ResourceEvent::Updated(obj) => {
                    if let Some(key) = object_key(&obj) {
                        self.cache.insert(key.clone(), obj).await;
                        self.queue.add(key);
                    }
                }
                ResourceEvent::Deleted(obj) => {
                    if let Some(key) = object_key(&obj) {
                        self.cache.remove(&key).await;
                        self.queue.add(key);
                    }
                }
            }
        }
        debug!(controller = %self.config.name, "Ingestion stopped");
    }

    /// True if the store synced before the timeout and before a stop request,
    /// whether it came from `stop` or from the watch source giving up
    async fn wait_for_cache_sync(&self) -> bool {
        tokio::select! {
            biased;
            result = tokio::time::timeout(self.config.cache_sync_timeout(), self.cache.wait_for_sync()) => result.is_ok(),
            () = self.stop.cancelled() => false,
        }
    }

    async fn run_worker(self: Arc<Self>, worker: usize) {
        debug!(controller = %self.config.name, worker, "Worker started");
        while self.process_next_item().await {}
        debug!(controller = %self.config.name, worker, "Worker stopped");
    }

    /// Process one key. Returns false once the queue is shut down.
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = AssertUnwindSafe(reconcile::sync(
            &key,
            &self.cache,
            self.api.as_ref(),
            self.reconciler.as_ref(),
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(panic_error(payload.as_ref())));

        self.handle_result(&key, result);
        self.queue.done(&key);
        true
    }

    /// Forget the key on success, requeue it with backoff on failure, and
    /// drop it once `max_retries` requeues have been spent
    fn handle_result(&self, key: &str, result: Result<SyncOutcome>) {
        let err = match result {
            Ok(outcome) => {
                debug!(controller = %self.config.name, key, ?outcome, "Reconciled");
                self.queue.forget(key);
                return;
            }
            Err(err) => err,
        };

        let requeues = self.queue.num_requeues(key);
        if requeues < self.config.max_retries {
            info!(
                controller = %self.config.name,
                key,
                attempt = requeues + 1,
                "🔄 Error while reconciling {}: {}, requeueing",
                key,
                err
            );
            self.queue.add_rate_limited(key.to_string());
            return;
        }

        self.queue.forget(key);
        error!(
            controller = %self.config.name,
            key,
            "💀 Dropping {} out of the queue: {}",
            key,
            err
        );
        self.report(ControllerError::RetriesExhausted {
            controller: self.config.name.clone(),
            key: key.to_string(),
            attempts: requeues + 1,
            source: err,
        });
    }

    async fn run_until_stopped(self: Arc<Self>) {
        let started = self.state_tx.send_if_modified(|state| {
            if *state == ControllerState::Created {
                *state = ControllerState::Syncing;
                true
            } else {
                false
            }
        });
        if !started {
            warn!(controller = %self.config.name, "Controller already started or stopped");
            return;
        }

        info!(controller = %self.config.name, "🚀 Running controller");

        let (events_tx, events_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
        let delay_loop = self.queue.spawn_delay_loop();
        let source = tokio::spawn(self.clone().run_source(events_tx));
        let ingest = tokio::spawn(self.clone().ingest(events_rx));

        let mut workers = Vec::new();
        if self.wait_for_cache_sync().await {
            self.set_state(ControllerState::Running);
            info!(
                controller = %self.config.name,
                "✅ Cache synced, starting {} workers",
                self.config.workers_number
            );
            for worker in 0..self.config.workers_number {
                workers.push(tokio::spawn(self.clone().run_worker(worker)));
            }

            self.stop.cancelled().await;
            self.set_state(ControllerState::Stopping);
            info!(controller = %self.config.name, "🛑 Stopping controller");
        } else if !self.stop.is_cancelled() {
            error!(controller = %self.config.name, "⏱️  Timed out waiting for caches to sync");
            self.report(ControllerError::CacheSyncTimeout {
                controller: self.config.name.clone(),
            });
        }

        self.signal_stop();
        for worker in workers {
            self.join("worker", worker).await;
        }
        self.join("watch source", source).await;
        self.join("ingestion", ingest).await;
        if let Some(delay_loop) = delay_loop {
            self.join("delay loop", delay_loop).await;
        }

        self.set_state(ControllerState::Stopped);
        info!(controller = %self.config.name, "Controller stopped");
    }

    async fn join(&self, what: &str, handle: JoinHandle<()>) {
        if let Err(e) = handle.await {
            error!(controller = %self.config.name, "❌ {} task failed: {}", what, e);
        }
    }
}

#[async_trait]
impl<K> Controller for ResourceController<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    fn run(self: Arc<Self>) -> BoxFuture<'static, ()> {
        self.run_until_stopped().boxed()
    }

    fn errors(&self) -> Option<mpsc::Receiver<ControllerError>> {
        self.errors_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn stop(&self) {
        // a controller that never ran has nothing to drain
        self.state_tx.send_if_modified(|state| {
            if *state == ControllerState::Created {
                *state = ControllerState::Stopped;
                true
            } else {
                false
            }
        });
        self.signal_stop();
    }

    fn state(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    async fn wait_stopped(&self) {
        let mut state_rx = self.state_tx.subscribe();
        // the sender lives in `self`, so the channel cannot close while we wait
        let _ = state_rx
            .wait_for(|state| *state == ControllerState::Stopped)
            .await;
    }
}
