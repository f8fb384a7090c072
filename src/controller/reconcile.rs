/**
 * Reconcile contract between the controller core and a domain rule
 */
use crate::error::{Error, Result};
use crate::k8s::ResourceApi;
use crate::k8s::cache::Store;
use kube::Resource;
use std::any::Any;
use tracing::debug;

/// Outcome of one successful reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The key is no longer in the cache
    Deleted,
    /// The object already matches its desired state
    Unchanged,
    /// A corrective write was applied
    Updated,
}

/// Domain rule that decides what an object should look like.
pub trait Reconciler<K>: Send + Sync {
    /// Return the corrected object when the rule applies and the correction
    /// is not already in place, `None` when `current` is converged.
    ///
    /// Must be idempotent: calling it on its own output returns `None`.
    fn desired_state(&self, current: &K) -> Option<K>;
}

/// Reconcile the object stored under `key`.
///
/// Reads the cached object, asks `reconciler` for its desired state and writes
/// it through `api` if it differs. The stored result replaces the cache entry
/// so a redelivered key sees the write, unless the watch delivered a newer
/// object for the key in the meantime.
///
/// # Errors
///
/// Returns the error of the corrective write
pub async fn sync<K>(
    key: &str,
    store: &Store<K>,
    api: &dyn ResourceApi<K>,
    reconciler: &dyn Reconciler<K>,
) -> Result<SyncOutcome>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let Some(current) = store.get(key).await else {
        debug!(key, "🗑️  Object does not exist anymore");
        return Ok(SyncOutcome::Deleted);
    };

    let Some(desired) = reconciler.desired_state(&current) else {
        return Ok(SyncOutcome::Unchanged);
    };

    let read_version = current.meta().resource_version.clone();
    let updated = api.update(&desired).await?;
    if !store
        .update_if_unchanged(key, read_version.as_deref(), updated)
        .await
    {
        debug!(key, "Cache moved on during the write, keeping the newer object");
    }
    Ok(SyncOutcome::Updated)
}

/// Turn a caught panic payload into an error
#[must_use]
pub fn panic_error(payload: &(dyn Any + Send)) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    Error::Panic(message)
}
