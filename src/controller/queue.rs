/**
 * Rate limited work queue of resource keys
 *
 * A key is either queued, in flight (handed to a worker and not yet `done`),
 * or both: a key added while in flight is marked dirty and goes back to the
 * queue once the worker calls `done`. A key is never handed to two workers
 * at the same time and never sits in the queue twice.
 */
use super::backoff::BackoffPolicy;
use crate::k8s::cache::ResourceKey;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::debug;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ResourceKey>,
    /// Keys that need processing, queued or waiting for their in-flight run to finish
    dirty: HashSet<ResourceKey>,
    processing: HashSet<ResourceKey>,
    failures: HashMap<ResourceKey, u32>,
    shutting_down: bool,
}

type DelayedAdd = (ResourceKey, Duration);

#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: BackoffPolicy,
    delayed_tx: mpsc::UnboundedSender<DelayedAdd>,
    delayed_rx: Mutex<Option<mpsc::UnboundedReceiver<DelayedAdd>>>,
    shutdown: CancellationToken,
}

impl WorkQueue {
    #[must_use]
    pub fn new(backoff: BackoffPolicy) -> Arc<Self> {
        let (delayed_tx, delayed_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
            delayed_tx,
            delayed_rx: Mutex::new(Some(delayed_rx)),
            shutdown: CancellationToken::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // no invariant spans a panic inside these short critical sections
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the task that moves delayed keys into the queue once their
    /// delay expires. Only the first call spawns; later calls return `None`.
    pub fn spawn_delay_loop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let delayed_rx = self
            .delayed_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let queue = self.clone();
        Some(tokio::spawn(async move {
            queue.run_delay_loop(delayed_rx).await;
        }))
    }

    async fn run_delay_loop(&self, mut delayed_rx: mpsc::UnboundedReceiver<DelayedAdd>) {
        let mut delayed: DelayQueue<ResourceKey> = DelayQueue::new();
        let mut waiting: HashMap<ResourceKey, (delay_queue::Key, Instant)> = HashMap::new();

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                Some((key, delay)) = delayed_rx.recv() => {
                    let deadline = Instant::now() + delay;
                    if let Some((entry, at)) = waiting.get_mut(&key) {
                        // keep the earlier deadline
                        if deadline < *at {
                            delayed.reset_at(entry, deadline);
                            *at = deadline;
                        }
                    } else {
                        let entry = delayed.insert_at(key.clone(), deadline);
                        waiting.insert(key, (entry, deadline));
                    }
                }
                Some(expired) = delayed.next(), if !delayed.is_empty() => {
                    let key = expired.into_inner();
                    waiting.remove(&key);
                    self.add(key);
                }
            }
        }

        debug!("⏱️  Delay loop stopped with {} keys pending", waiting.len());
    }

    /// Queue `key` unless it is already waiting to be processed
    pub fn add(&self, key: ResourceKey) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Queue `key` once `delay` has elapsed
    pub fn add_after(&self, key: ResourceKey, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        // the receiver only goes away after shutdown
        let _ = self.delayed_tx.send((key, delay));
    }

    /// Queue `key` after a backoff that grows with its number of requeues
    pub fn add_rate_limited(&self, key: ResourceKey) {
        let attempt = {
            let mut state = self.state();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let attempt = *failures;
            *failures += 1;
            attempt
        };
        let delay = self.backoff.next(attempt);
        debug!(key = %key, ?delay, "⏱️  Requeue scheduled");
        self.add_after(key, delay);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ResourceKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as no longer in flight, releasing a pending re-add
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Reset the requeue counter of `key`
    pub fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Stop accepting keys and wake every blocked `get`
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
