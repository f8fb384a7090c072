/**
 * Watch source
 *
 * Turns a resource collection into a stream of `ResourceEvent`s for one
 * controller, either by following the watch stream or by listing on an
 * interval. Both modes start with a full list so the store can sync.
 */
use super::backoff::BackoffPolicy;
use crate::config::WatchMode;
use crate::error::Result;
use crate::k8s::cache::config::{
    INITIAL_BACKOFF_SECONDS, MAX_BACKOFF_SECONDS, MAX_WATCH_RESTARTS, RESTART_DELAY_SECONDS,
};
use crate::k8s::{ResourceApi, ResourceEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct WatchSource<K>
where
    K: Send + Sync + 'static,
{
    controller: String,
    api: Arc<dyn ResourceApi<K>>,
    mode: WatchMode,
    poll_interval: Duration,
    restart_backoff: BackoffPolicy,
    max_restarts: u32,
}

impl<K> WatchSource<K>
where
    K: Send + Sync + 'static,
{
    #[must_use]
    pub fn new(
        controller: String,
        api: Arc<dyn ResourceApi<K>>,
        mode: WatchMode,
        poll_interval: Duration,
    ) -> Self {
        Self {
            controller,
            api,
            mode,
            poll_interval,
            restart_backoff: BackoffPolicy::new(
                Duration::from_secs(INITIAL_BACKOFF_SECONDS),
                Duration::from_secs(MAX_BACKOFF_SECONDS),
            ),
            max_restarts: MAX_WATCH_RESTARTS,
        }
    }

    /// Pace failed watch cycles with `backoff` and give up after
    /// `max_restarts` consecutive failures
    #[must_use]
    pub fn with_restart_policy(mut self, backoff: BackoffPolicy, max_restarts: u32) -> Self {
        self.restart_backoff = backoff;
        self.max_restarts = max_restarts.max(1);
        self
    }

    /// Produce events until `stop` is cancelled or the receiver goes away.
    ///
    /// # Errors
    ///
    /// In watch mode, returns the last error once the list and watch cycle
    /// failed `max_restarts` times in a row
    pub async fn run(
        &self,
        events: mpsc::Sender<ResourceEvent<K>>,
        stop: CancellationToken,
    ) -> Result<()> {
        match self.mode {
            WatchMode::Watch => self.run_watch(&events, &stop).await,
            WatchMode::Poll => {
                self.run_poll(&events, &stop).await;
                Ok(())
            }
        }
    }

    async fn run_watch(
        &self,
        events: &mpsc::Sender<ResourceEvent<K>>,
        stop: &CancellationToken,
    ) -> Result<()> {
        info!(controller = %self.controller, "🔍 Starting watch source");

        let mut failures = 0;

        loop {
            let cycle = tokio::select! {
                () = stop.cancelled() => break,
                result = self.list_and_watch(events) => result,
            };

            if events.is_closed() {
                break;
            }

            let delay = match cycle {
                Ok(()) => {
                    info!(controller = %self.controller, "🔍 Watch stream ended normally, restarting...");
                    failures = 0;
                    Duration::from_secs(RESTART_DELAY_SECONDS)
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.max_restarts {
                        error!(
                            controller = %self.controller,
                            "❌ Watch exceeded maximum restart attempts ({}), stopping",
                            self.max_restarts
                        );
                        return Err(e);
                    }
                    let delay = self.restart_backoff.next(failures - 1);
                    error!(
                        controller = %self.controller,
                        "❌ Watch failed (attempt {}/{}): {}, restarting in {:?}",
                        failures, self.max_restarts, e, delay
                    );
                    delay
                }
            };

            if sleep_or_stop(stop, delay).await {
                break;
            }
        }

        debug!(controller = %self.controller, "Watch source stopped");
        Ok(())
    }

    /// One list followed by a watch from the listed version until the stream ends
    async fn list_and_watch(&self, events: &mpsc::Sender<ResourceEvent<K>>) -> Result<()> {
        let list = self.api.list().await?;
        if events.send(ResourceEvent::Restarted(list.items)).await.is_err() {
            return Ok(());
        }
        self.api.watch(&list.resource_version, events).await
    }

    async fn run_poll(&self, events: &mpsc::Sender<ResourceEvent<K>>, stop: &CancellationToken) {
        info!(
            controller = %self.controller,
            "🔍 Starting poll source (every {}s)",
            self.poll_interval.as_secs()
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let listed = tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => tokio::select! {
                    () = stop.cancelled() => break,
                    result = self.api.list() => result,
                },
            };

            match listed {
                Ok(list) => {
                    if events.send(ResourceEvent::Restarted(list.items)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(controller = %self.controller, "⚠️  List failed, retrying next tick: {}", e);
                }
            }
        }

        debug!(controller = %self.controller, "Poll source stopped");
    }
}

/// Sleep for `duration`; returns true if `stop` fired first
async fn sleep_or_stop(stop: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = stop.cancelled() => true,
        () = sleep(duration) => false,
    }
}
