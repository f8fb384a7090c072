//! Level-triggered reconciliation controllers for Kubernetes.
//!
//! A controller mirrors a resource collection in a local [`k8s::cache::Store`],
//! turns change notifications into keys on a rate limited
//! [`controller::WorkQueue`], and lets a pool of workers drive every object to
//! the state a [`controller::Reconciler`] asks for. The [`engine::Engine`]
//! owns a set of named controllers and manages their lifecycle.

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod k8s;

pub use config::{Config, ControllerConfig, WatchMode};
pub use controller::{Controller, ControllerError, ControllerState, Reconciler, ResourceController};
pub use engine::Engine;
pub use error::{Error, Result};
