#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeStatus, NodeSystemInfo};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use node_labeler::controller::Reconciler;
use node_labeler::error::{Error, Result};
use node_labeler::k8s::nodes::{ContainerLinuxLabeler, LINUX_CONTAINER_LABEL};
use node_labeler::k8s::{ResourceApi, ResourceEvent, ResourceList};
use node_labeler::{ControllerConfig, ControllerState, ResourceController};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

pub fn node(name: &str, os_image: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            ..ObjectMeta::default()
        },
        status: Some(NodeStatus {
            node_info: Some(NodeSystemInfo {
                os_image: os_image.to_string(),
                ..NodeSystemInfo::default()
            }),
            ..NodeStatus::default()
        }),
        ..Node::default()
    }
}

pub fn label_of(node: &Node) -> Option<String> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LINUX_CONTAINER_LABEL).cloned())
}

/// In-memory node collection standing in for the API server
pub struct FakeNodeApi {
    nodes: Mutex<BTreeMap<String, Node>>,
    collection_version: AtomicU64,
    watch_tx: mpsc::Sender<ResourceEvent<Node>>,
    watch_rx: tokio::sync::Mutex<mpsc::Receiver<ResourceEvent<Node>>>,
    watch_end: Notify,
    watched_from: Mutex<Vec<String>>,
    list_blocks: AtomicBool,
    lists: AtomicU32,
    list_failures_left: AtomicU32,
    watch_failures_left: AtomicU32,
    failures_left: AtomicU32,
    update_delay: Mutex<Duration>,
    updates_started: AtomicU32,
    in_flight: Mutex<HashSet<String>>,
    overlapping_updates: AtomicU32,
}

impl FakeNodeApi {
    pub fn new(nodes: Vec<Node>) -> Arc<Self> {
        let (watch_tx, watch_rx) = mpsc::channel(100);
        Arc::new(Self {
            nodes: Mutex::new(
                nodes
                    .into_iter()
                    .map(|node| (node.metadata.name.clone().unwrap_or_default(), node))
                    .collect(),
            ),
            collection_version: AtomicU64::new(1),
            watch_tx,
            watch_rx: tokio::sync::Mutex::new(watch_rx),
            watch_end: Notify::new(),
            watched_from: Mutex::new(Vec::new()),
            list_blocks: AtomicBool::new(false),
            lists: AtomicU32::new(0),
            list_failures_left: AtomicU32::new(0),
            watch_failures_left: AtomicU32::new(0),
            failures_left: AtomicU32::new(0),
            update_delay: Mutex::new(Duration::ZERO),
            updates_started: AtomicU32::new(0),
            in_flight: Mutex::new(HashSet::new()),
            overlapping_updates: AtomicU32::new(0),
        })
    }

    /// Make `list` hang forever
    pub fn block_list(&self) {
        self.list_blocks.store(true, Ordering::SeqCst);
    }

    /// Fail the next `count` lists
    pub fn fail_lists(&self, count: u32) {
        self.list_failures_left.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` watch calls right away
    pub fn fail_watches(&self, count: u32) {
        self.watch_failures_left.store(count, Ordering::SeqCst);
    }

    /// End the running watch stream as the server does on timeout
    pub fn end_watch(&self) {
        self.watch_end.notify_one();
    }

    pub fn lists(&self) -> u32 {
        self.lists.load(Ordering::SeqCst)
    }

    /// Versions every watch call started from, in order
    pub fn watched_from(&self) -> Vec<String> {
        self.watched_from.lock().unwrap().clone()
    }

    pub fn collection_version(&self) -> String {
        self.collection_version.load(Ordering::SeqCst).to_string()
    }

    /// Fail the next `count` updates
    pub fn fail_updates(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn set_update_delay(&self, delay: Duration) {
        *self.update_delay.lock().unwrap() = delay;
    }

    pub fn updates_started(&self) -> u32 {
        self.updates_started.load(Ordering::SeqCst)
    }

    pub fn overlapping_updates(&self) -> u32 {
        self.overlapping_updates.load(Ordering::SeqCst)
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// Change the server side collection without a watch event
    pub fn put_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.nodes.lock().unwrap().insert(name, node);
        self.collection_version.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn emit(&self, event: ResourceEvent<Node>) {
        self.watch_tx.send(event).await.unwrap();
    }
}

#[async_trait]
impl ResourceApi<Node> for FakeNodeApi {
    async fn list(&self) -> Result<ResourceList<Node>> {
        if self.list_blocks.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.lists.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.list_failures_left) {
            return Err(Error::Custom("injected list failure".to_string()));
        }
        let items = self.nodes.lock().unwrap().values().cloned().collect();
        Ok(ResourceList {
            items,
            resource_version: self.collection_version(),
        })
    }

    async fn watch(
        &self,
        resource_version: &str,
        events: &mpsc::Sender<ResourceEvent<Node>>,
    ) -> Result<()> {
        self.watched_from
            .lock()
            .unwrap()
            .push(resource_version.to_string());
        if take_failure(&self.watch_failures_left) {
            return Err(Error::Custom("injected watch failure".to_string()));
        }

        let mut watch_rx = self.watch_rx.lock().await;
        loop {
            tokio::select! {
                event = watch_rx.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                () = self.watch_end.notified() => return Ok(()),
            }
        }
    }

    async fn update(&self, obj: &Node) -> Result<Node> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.updates_started.fetch_add(1, Ordering::SeqCst);
        if !self.in_flight.lock().unwrap().insert(name.clone()) {
            self.overlapping_updates.fetch_add(1, Ordering::SeqCst);
        }

        let delay = *self.update_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.in_flight.lock().unwrap().remove(&name);

        if take_failure(&self.failures_left) {
            return Err(Error::Custom(format!("injected failure updating {name}")));
        }

        let mut stored = obj.clone();
        let version = stored
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        stored.metadata.resource_version = Some((version + 1).to_string());
        self.nodes.lock().unwrap().insert(name, stored.clone());
        self.collection_version.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }
}

/// Consume one injected failure if any are left
fn take_failure(left: &AtomicU32) -> bool {
    left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

/// Labeler that panics the first time it is asked about a node
#[derive(Default)]
pub struct PanicOnce {
    panicked: AtomicBool,
}

impl Reconciler<Node> for PanicOnce {
    fn desired_state(&self, current: &Node) -> Option<Node> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("labeler exploded");
        }
        ContainerLinuxLabeler.desired_state(current)
    }
}

pub fn controller_config(name: &str) -> ControllerConfig {
    let mut config = ControllerConfig::new(name, "nodes");
    config.backoff_base_ms = 1;
    config.backoff_max_secs = 1;
    config.cache_sync_timeout_secs = 5;
    config
}

pub fn labeling_controller(
    config: ControllerConfig,
    api: &Arc<FakeNodeApi>,
) -> Arc<ResourceController<Node>> {
    let api: Arc<dyn ResourceApi<Node>> = api.clone();
    Arc::new(ResourceController::<Node>::new(config, api, Arc::new(ContainerLinuxLabeler)).unwrap())
}

/// Poll `condition` until it holds or `timeout` expires
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub async fn wait_for_state(
    state: impl Fn() -> ControllerState,
    expected: ControllerState,
) -> bool {
    eventually(Duration::from_secs(5), || state() == expected).await
}
