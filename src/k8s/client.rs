// Client creation with custom user-agent support for kube 2.x
use crate::error::Result as NlResult;
use hyper::http::{HeaderName, HeaderValue};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tracing::{debug, warn};

/// Create a new k8s client to interact with k8s cluster api
///
/// Uses the kubeconfig at `kube_config_path` when given and non-empty, otherwise infers the
/// configuration (in-cluster service account or the default kubeconfig).
///
/// # Errors
///
/// Will return `Err` if the configuration cannot be loaded or the client cannot be built
pub async fn new(kube_config_path: Option<&Path>, custom_user_agent: Option<&str>) -> NlResult<Client> {
    let kube_config_path = kube_config_path.filter(|path| !path.as_os_str().is_empty());
    let mut config = match kube_config_path {
        Some(path) => {
            debug!("📄 Loading Kubernetes configuration from {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => {
            debug!("📄 Loading Kubernetes configuration from default sources");
            Config::infer().await?
        }
    };

    if let Some(user_agent) = custom_user_agent {
        match HeaderValue::from_str(user_agent) {
            Ok(header_value) => config
                .headers
                .push((HeaderName::from_static("user-agent"), header_value)),
            Err(e) => warn!("Ignoring invalid user agent {user_agent:?}: {e}"),
        }
    }

    let client = Client::try_from(config)?;

    Ok(client)
}
