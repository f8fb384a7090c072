/**
 * Narrow resource access contract the controllers are written against,
 * and its implementation on top of a kube `Api`.
 */
use super::cache::config::WATCH_TIMEOUT_SECONDS;
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{Api, ListParams, PostParams, WatchEvent, WatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio::sync::mpsc;
use tracing::debug;

/// A change notification for one object of the watched collection
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    Added(K),
    Updated(K),
    Deleted(K),
    /// A fresh full list of the collection, replacing everything seen before
    Restarted(Vec<K>),
}

/// One full list of the collection and the version it was read at
#[derive(Debug, Clone)]
pub struct ResourceList<K> {
    pub items: Vec<K>,
    /// Collection resourceVersion a watch resumes from
    pub resource_version: String,
}

/// Access to one resource collection.
#[async_trait]
pub trait ResourceApi<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// List the whole collection
    async fn list(&self) -> Result<ResourceList<K>>;

    /// Stream the changes made after `resource_version` into `events` until
    /// the server ends the watch.
    ///
    /// Returns `Ok(())` when the stream ends normally or the receiver is gone.
    async fn watch(&self, resource_version: &str, events: &mpsc::Sender<ResourceEvent<K>>) -> Result<()>;

    /// Write `obj` back and return the stored result
    async fn update(&self, obj: &K) -> Result<K>;
}

/// `ResourceApi` backed by the Kubernetes API server
pub struct KubeResourceApi<K>
where
    K: Resource,
{
    api: Api<K>,
}

impl<K> KubeResourceApi<K>
where
    K: Resource<DynamicType = ()>,
{
    /// Access to a cluster scoped collection, or all namespaces of a namespaced one
    #[must_use]
    pub fn all(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl<K> ResourceApi<K> for KubeResourceApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    async fn list(&self) -> Result<ResourceList<K>> {
        let list = self.api.list(&ListParams::default()).await?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(
            "📋 Listed {} objects at version {:?}",
            list.items.len(),
            resource_version
        );
        Ok(ResourceList {
            items: list.items,
            resource_version,
        })
    }

    async fn watch(&self, resource_version: &str, events: &mpsc::Sender<ResourceEvent<K>>) -> Result<()> {
        use futures::{TryStreamExt, pin_mut};

        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECONDS);
        let stream = self.api.watch(&wp, resource_version).await?;
        pin_mut!(stream);

        while let Some(event) = stream.try_next().await? {
            let event = match event {
                WatchEvent::Added(obj) => ResourceEvent::Added(obj),
                WatchEvent::Modified(obj) => ResourceEvent::Updated(obj),
                WatchEvent::Deleted(obj) => ResourceEvent::Deleted(obj),
                WatchEvent::Bookmark(_) => continue,
                WatchEvent::Error(status) => return Err(Error::Kube(kube::Error::Api(status))),
            };
            if events.send(event).await.is_err() {
                debug!("Event receiver dropped, ending watch");
                break;
            }
        }

        Ok(())
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let updated = self.api.replace(&name, &PostParams::default(), obj).await?;
        Ok(updated)
    }
}
