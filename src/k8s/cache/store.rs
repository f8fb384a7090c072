use kube::Resource;
use std::collections::HashMap;
use tokio::sync::{RwLock, watch};
use tracing::debug;

/// Opaque identifier of one watched object, `namespace/name` or `name`
pub type ResourceKey = String;

/// Derive the queue and cache key for an object.
///
/// Returns `None` for objects without a name, which cannot be tracked.
pub fn object_key<K: Resource>(obj: &K) -> Option<ResourceKey> {
    let meta = obj.meta();
    let name = meta.name.as_deref().filter(|name| !name.is_empty())?;
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => Some(format!("{ns}/{name}")),
        _ => Some(name.to_string()),
    }
}

fn resource_version<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta().resource_version.as_deref()
}

/// In-memory mirror of the last observed state of every watched object.
///
/// The ingestion path owns the store. Workers only publish the result of
/// their own write, and only over the exact version they read.
#[derive(Debug)]
pub struct Store<K> {
    objects: RwLock<HashMap<ResourceKey, K>>,
    synced_tx: watch::Sender<bool>,
}

impl<K> Default for Store<K>
where
    K: Resource + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Store<K>
where
    K: Resource + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            objects: RwLock::new(HashMap::new()),
            synced_tx,
        }
    }

    pub async fn get(&self, key: &str) -> Option<K> {
        self.objects.read().await.get(key).cloned()
    }

    /// Add or replace the object stored under `key`
    pub async fn insert(&self, key: ResourceKey, obj: K) {
        self.objects.write().await.insert(key, obj);
    }

    /// Store `obj` under `key` only if the entry still carries the
    /// `expected` resource version. Returns whether the entry was written.
    pub async fn update_if_unchanged(&self, key: &str, expected: Option<&str>, obj: K) -> bool {
        let mut objects = self.objects.write().await;
        match objects.get_mut(key) {
            Some(current) if resource_version(current) == expected => {
                *current = obj;
                true
            }
            _ => false,
        }
    }

    pub async fn remove(&self, key: &str) -> Option<K> {
        self.objects.write().await.remove(key)
    }

    pub async fn list_keys(&self) -> Vec<ResourceKey> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Replace the whole mirror with a fresh full list.
    ///
    /// Returns the keys that were added, changed, or removed. Objects with
    /// an unchanged resource version are not reported. Marks the store as
    /// synced.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn replace(&self, objects: Vec<K>) -> Vec<ResourceKey> {
        let mut changed = Vec::new();
        let mut fresh = HashMap::with_capacity(objects.len());

        for obj in objects {
            if let Some(key) = object_key(&obj) {
                fresh.insert(key, obj);
            }
        }

        {
            let mut current = self.objects.write().await;

            for key in current.keys() {
                if !fresh.contains_key(key) {
                    changed.push(key.clone());
                }
            }

            for (key, obj) in &fresh {
                let unchanged = current.get(key).is_some_and(|old| {
                    resource_version(old).is_some() && resource_version(old) == resource_version(obj)
                });
                if !unchanged {
                    changed.push(key.clone());
                }
            }

            *current = fresh;
        }

        debug!("💾 Store replaced, {} keys changed", changed.len());
        self.synced_tx.send_replace(true);
        changed
    }

    /// True once the initial full list has been applied, and forever after
    pub fn has_synced(&self) -> bool {
        *self.synced_tx.borrow()
    }

    /// Resolve once the initial full list has been applied
    pub async fn wait_for_sync(&self) {
        let mut synced_rx = self.synced_tx.subscribe();
        // the sender lives in `self`, so the channel cannot close while we wait
        let _ = synced_rx.wait_for(|synced| *synced).await;
    }
}
