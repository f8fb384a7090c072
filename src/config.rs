/**
 * Engine and controller configuration, loaded from a JSON file
 */
use crate::error::{Error, Result};
use crate::k8s::cache::config::{INITIAL_BACKOFF_SECONDS, MAX_BACKOFF_SECONDS, MAX_WATCH_RESTARTS};
use k8s_openapi::serde_json;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of workers per controller
pub const DEFAULT_WORKERS_NUMBER: usize = 1;

/// Default number of retries before a key is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default interval between full lists in poll mode
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default bound on the initial cache sync
pub const DEFAULT_CACHE_SYNC_TIMEOUT_SECS: u64 = 60;

/// Default base delay of the per-key retry backoff
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5;

/// Default cap of the per-key retry backoff
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 1000;

/// Default base delay between failed watch cycles
pub const DEFAULT_WATCH_BACKOFF_BASE_MS: u64 = INITIAL_BACKOFF_SECONDS * 1000;

/// Default cap of the delay between failed watch cycles
pub const DEFAULT_WATCH_BACKOFF_MAX_SECS: u64 = MAX_BACKOFF_SECONDS;

/// Default time the engine waits for controllers to drain on stop
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Resource collections a controller can be configured for
pub const SUPPORTED_RESOURCES: &[&str] = &["nodes"];

/// How the watch source observes the resource collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Continuous watch stream, resumed when it ends
    #[default]
    Watch,
    /// Periodic full list diffed against the cache
    Poll,
}

/// Top level configuration for the controllers engine
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Explicit kubeconfig; in-cluster or inferred config when empty
    #[serde(default)]
    pub kube_config_path: Option<PathBuf>,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
}

/// Configuration of one controller
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub name: String,

    /// Zero falls back to the default
    #[serde(default = "default_workers_number")]
    pub workers_number: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub resource: String,

    #[serde(default)]
    pub mode: WatchMode,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_cache_sync_timeout_secs")]
    pub cache_sync_timeout_secs: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Consecutive failed watch cycles before the controller gives up
    #[serde(default = "default_max_watch_restarts")]
    pub max_watch_restarts: u32,

    #[serde(default = "default_watch_backoff_base_ms")]
    pub watch_backoff_base_ms: u64,

    #[serde(default = "default_watch_backoff_max_secs")]
    pub watch_backoff_max_secs: u64,
}

const fn default_workers_number() -> usize {
    DEFAULT_WORKERS_NUMBER
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

const fn default_cache_sync_timeout_secs() -> u64 {
    DEFAULT_CACHE_SYNC_TIMEOUT_SECS
}

const fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

const fn default_backoff_max_secs() -> u64 {
    DEFAULT_BACKOFF_MAX_SECS
}

const fn default_max_watch_restarts() -> u32 {
    MAX_WATCH_RESTARTS
}

const fn default_watch_backoff_base_ms() -> u64 {
    DEFAULT_WATCH_BACKOFF_BASE_MS
}

const fn default_watch_backoff_max_secs() -> u64 {
    DEFAULT_WATCH_BACKOFF_MAX_SECS
}

const fn default_shutdown_timeout_secs() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

impl Config {
    /// Load and validate the configuration file at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails validation
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Parse and validate a configuration document
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid JSON or fails validation
    pub fn from_json(data: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(data)?;
        config.kube_config_path = config
            .kube_config_path
            .filter(|path| !path.as_os_str().is_empty());
        for controller in &mut config.controllers {
            controller.apply_defaults();
        }
        config.validate()?;
        Ok(config)
    }

    /// Check engine level invariants and every controller configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violation found
    pub fn validate(&self) -> Result<()> {
        if self.controllers.is_empty() {
            return Err(Error::Config("no controllers configured".to_string()));
        }

        let mut names = HashSet::new();
        for controller in &self.controllers {
            controller.validate()?;
            if !names.insert(controller.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate controller name {:?}",
                    controller.name
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl ControllerConfig {
    /// A configuration for `resource` with every other field at its default
    #[must_use]
    pub fn new(name: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers_number: DEFAULT_WORKERS_NUMBER,
            max_retries: DEFAULT_MAX_RETRIES,
            resource: resource.into(),
            mode: WatchMode::default(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            cache_sync_timeout_secs: DEFAULT_CACHE_SYNC_TIMEOUT_SECS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            max_watch_restarts: MAX_WATCH_RESTARTS,
            watch_backoff_base_ms: DEFAULT_WATCH_BACKOFF_BASE_MS,
            watch_backoff_max_secs: DEFAULT_WATCH_BACKOFF_MAX_SECS,
        }
    }

    pub const fn apply_defaults(&mut self) {
        if self.workers_number == 0 {
            self.workers_number = DEFAULT_WORKERS_NUMBER;
        }
    }

    /// # Errors
    ///
    /// Returns `Error::Config` if a required field is missing or out of range
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("controller name cannot be empty".to_string()));
        }
        if self.resource.is_empty() {
            return Err(Error::Config(format!(
                "controller {:?}: resource cannot be empty",
                self.name
            )));
        }
        if !SUPPORTED_RESOURCES.contains(&self.resource.as_str()) {
            return Err(Error::Config(format!(
                "controller {:?}: unsupported resource {:?}",
                self.name, self.resource
            )));
        }
        if self.workers_number == 0 {
            return Err(Error::Config(format!(
                "controller {:?}: workers_number must be at least 1",
                self.name
            )));
        }
        if self.mode == WatchMode::Poll && self.poll_interval_secs == 0 {
            return Err(Error::Config(format!(
                "controller {:?}: poll_interval_secs must be positive",
                self.name
            )));
        }
        if self.max_watch_restarts == 0 {
            return Err(Error::Config(format!(
                "controller {:?}: max_watch_restarts must be at least 1",
                self.name
            )));
        }
        if self.cache_sync_timeout_secs == 0 {
            return Err(Error::Config(format!(
                "controller {:?}: cache_sync_timeout_secs must be positive",
                self.name
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub const fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    #[must_use]
    pub const fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    #[must_use]
    pub const fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    #[must_use]
    pub const fn watch_backoff_base(&self) -> Duration {
        Duration::from_millis(self.watch_backoff_base_ms)
    }

    #[must_use]
    pub const fn watch_backoff_max(&self) -> Duration {
        Duration::from_secs(self.watch_backoff_max_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_json(
            r#"{"controllers": [{"name": "linux-container", "resource": "nodes", "workers_number": 0}]}"#,
        )
        .unwrap();

        assert!(config.kube_config_path.is_none());
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));

        let controller = &config.controllers[0];
        assert_eq!(controller.workers_number, 1);
        assert_eq!(controller.max_retries, 5);
        assert_eq!(controller.mode, WatchMode::Watch);
        assert_eq!(controller.backoff_base(), Duration::from_millis(5));
        assert_eq!(controller.max_watch_restarts, 50);
        assert_eq!(controller.watch_backoff_base(), Duration::from_secs(1));
        assert_eq!(controller.watch_backoff_max(), Duration::from_secs(60));
    }

    #[test]
    fn test_explicit_values() {
        let config = Config::from_json(
            r#"{
                "kube_config_path": "/tmp/kubeconfig",
                "controllers": [{
                    "name": "linux-container",
                    "resource": "nodes",
                    "workers_number": 4,
                    "max_retries": 0,
                    "mode": "poll",
                    "poll_interval_secs": 10
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.kube_config_path.as_deref(),
            Some(Path::new("/tmp/kubeconfig"))
        );
        let controller = &config.controllers[0];
        assert_eq!(controller.workers_number, 4);
        assert_eq!(controller.max_retries, 0);
        assert_eq!(controller.mode, WatchMode::Poll);
        assert_eq!(controller.poll_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_empty_kube_config_path_means_inferred() {
        let config = Config::from_json(
            r#"{
                "kube_config_path": "",
                "controllers": [{"name": "linux-container", "resource": "nodes"}]
            }"#,
        )
        .unwrap();

        assert!(config.kube_config_path.is_none());
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            r#"{"controllers": []}"#,
            r#"{"controllers": [{"resource": "nodes"}]}"#,
            r#"{"controllers": [{"name": "a"}]}"#,
            r#"{"controllers": [{"name": "a", "resource": "pods"}]}"#,
            r#"{"controllers": [{"name": "a", "resource": "nodes"}, {"name": "a", "resource": "nodes"}]}"#,
            r#"{"controllers": [{"name": "a", "resource": "nodes", "mode": "poll", "poll_interval_secs": 0}]}"#,
            r#"{"controllers": [{"name": "a", "resource": "nodes", "max_watch_restarts": 0}]}"#,
        ];

        for case in cases {
            assert!(
                matches!(Config::from_json(case), Err(Error::Config(_))),
                "expected config error for {case}"
            );
        }
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(Config::from_json("{"), Err(Error::Json(_))));
    }
}
