/**
 * Controllers engine
 *
 * Owns the named controllers, starts and stops them, and fans their error
 * channels into one stream. The registry is fixed at construction.
 */
use crate::config::{Config, ControllerConfig};
use crate::controller::{Controller, ControllerError, ControllerState, ResourceController};
use crate::error::{Error, Result};
use crate::k8s::cache::config::ERROR_CHANNEL_CAPACITY;
use crate::k8s::nodes::ContainerLinuxLabeler;
use crate::k8s::{KubeResourceApi, ResourceApi, USER_AGENT, client};
use k8s_openapi::api::core::v1::Node;
use kube::Client;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Engine {
    controllers: BTreeMap<String, Arc<dyn Controller>>,
    shutdown_timeout: Duration,
    started: AtomicBool,
    errors_tx: mpsc::Sender<ControllerError>,
    errors_rx: Mutex<Option<mpsc::Receiver<ControllerError>>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    forwarding: CancellationToken,
}

impl Engine {
    /// Build an engine over already constructed controllers.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if there are no controllers or two share a name
    pub fn new(controllers: Vec<Arc<dyn Controller>>, shutdown_timeout: Duration) -> Result<Self> {
        if controllers.is_empty() {
            return Err(Error::Config("no controllers configured".to_string()));
        }

        let mut registry = BTreeMap::new();
        for controller in controllers {
            let name = controller.name().to_string();
            if name.is_empty() {
                return Err(Error::Config("controller name cannot be empty".to_string()));
            }
            if registry.insert(name.clone(), controller).is_some() {
                return Err(Error::Config(format!("duplicate controller name {name:?}")));
            }
        }

        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        Ok(Self {
            controllers: registry,
            shutdown_timeout,
            started: AtomicBool::new(false),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
            forwarders: Mutex::new(Vec::new()),
            forwarding: CancellationToken::new(),
        })
    }

    /// Validate `config`, connect to the cluster and build every controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the client cannot be
    /// created, or any controller fails to build
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let client = client::new(config.kube_config_path.as_deref(), Some(USER_AGENT)).await?;
        let controllers = config
            .controllers
            .iter()
            .map(|controller| build_controller(controller, client.clone()))
            .collect::<Result<Vec<_>>>()?;

        Self::new(controllers, config.shutdown_timeout())
    }

    /// Launch every controller and the error forwarding. Returns immediately;
    /// calls after the first are ignored.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Engine already started");
            return;
        }

        info!("🚀 Starting {} controllers", self.controllers.len());

        let mut forwarders = self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for controller in self.controllers.values() {
            if let Some(errors) = controller.errors() {
                forwarders.push(tokio::spawn(forward_errors(
                    controller.name().to_string(),
                    errors,
                    self.errors_tx.clone(),
                    self.forwarding.clone(),
                )));
            }
            tokio::spawn(controller.clone().run());
        }
    }

    /// Stop every controller and wait, up to the shutdown timeout, for all of
    /// them to finish their in-flight work.
    pub async fn stop(&self) {
        info!("🛑 Stopping {} controllers", self.controllers.len());

        for controller in self.controllers.values() {
            controller.stop();
        }

        let drained = tokio::time::timeout(
            self.shutdown_timeout,
            futures::future::join_all(self.controllers.values().map(|c| c.wait_stopped())),
        )
        .await;

        if drained.is_err() {
            for controller in self.controllers.values() {
                let state = controller.state();
                if state != ControllerState::Stopped {
                    warn!(
                        controller = controller.name(),
                        %state,
                        "⚠️  Controller did not stop within {:?}",
                        self.shutdown_timeout
                    );
                }
            }
        }

        self.forwarding.cancel();
        let forwarders = std::mem::take(
            &mut *self
                .forwarders
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for forwarder in forwarders {
            if let Err(e) = forwarder.await {
                error!("❌ Error forwarding task failed: {}", e);
            }
        }

        info!("Engine stopped");
    }

    /// Take the aggregated error stream. Returns `None` after the first call.
    pub fn errors(&self) -> Option<mpsc::Receiver<ControllerError>> {
        self.errors_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    #[must_use]
    pub fn controller(&self, name: &str) -> Option<&Arc<dyn Controller>> {
        self.controllers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.controllers.keys().map(String::as_str)
    }
}

/// Build the controller serving `config.resource`
fn build_controller(config: &ControllerConfig, client: Client) -> Result<Arc<dyn Controller>> {
    match config.resource.as_str() {
        "nodes" => {
            let api: Arc<dyn ResourceApi<Node>> = Arc::new(KubeResourceApi::<Node>::all(client));
            let controller =
                ResourceController::<Node>::new(config.clone(), api, Arc::new(ContainerLinuxLabeler))?;
            Ok(Arc::new(controller))
        }
        other => Err(Error::Config(format!(
            "controller {:?}: unsupported resource {other:?}",
            config.name
        ))),
    }
}

/// Log every error of one controller and pass it on to the engine stream.
///
/// Errors already queued are drained before `stop` ends the loop.
async fn forward_errors(
    controller: String,
    mut errors: mpsc::Receiver<ControllerError>,
    engine_tx: mpsc::Sender<ControllerError>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            Some(err) = errors.recv() => {
                error!(controller = %controller, "error occurred while processing: {}", err);
                if engine_tx.try_send(err).is_err() {
                    debug!(controller = %controller, "Engine error stream full or closed");
                }
            }
            () = stop.cancelled() => break,
        }
    }
}
