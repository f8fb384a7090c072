pub mod backoff;
pub mod queue;
pub mod reconcile;
pub mod resource_controller;
pub mod watch;

pub use backoff::BackoffPolicy;
pub use queue::WorkQueue;
pub use reconcile::Reconciler;
pub use resource_controller::ResourceController;
pub use watch::WatchSource;

use crate::error::Error;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle of a controller. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ControllerState {
    Created,
    /// Watch source running, waiting for the initial list
    Syncing,
    /// Workers processing the queue
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Syncing => "syncing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Errors a running controller reports on its error channel
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("controller {controller}: timed out waiting for caches to sync")]
    CacheSyncTimeout { controller: String },

    #[error("controller {controller}: dropping {key} out of the queue after {attempts} attempts: {source}")]
    RetriesExhausted {
        controller: String,
        key: String,
        attempts: u32,
        #[source]
        source: Error,
    },

    #[error("controller {controller}: watch source gave up: {source}")]
    WatchFailed {
        controller: String,
        #[source]
        source: Error,
    },
}

impl ControllerError {
    #[must_use]
    pub fn controller(&self) -> &str {
        match self {
            Self::CacheSyncTimeout { controller }
            | Self::RetriesExhausted { controller, .. }
            | Self::WatchFailed { controller, .. } => controller,
        }
    }
}

/// A named, independently startable and stoppable reconciliation unit
#[async_trait]
pub trait Controller: Send + Sync {
    fn name(&self) -> &str;

    /// Run until stopped. Resolves after every worker has finished its
    /// current reconciliation. Only the first call does anything.
    fn run(self: Arc<Self>) -> BoxFuture<'static, ()>;

    /// Take the receiving end of the error channel. Returns `None` after the first call.
    fn errors(&self) -> Option<mpsc::Receiver<ControllerError>>;

    /// Signal shutdown without waiting for it. Safe to call any number of times.
    fn stop(&self);

    fn state(&self) -> ControllerState;

    /// Wait until the controller reaches `Stopped`
    async fn wait_stopped(&self);
}
