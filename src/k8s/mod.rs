pub mod cache;
pub mod client;
pub mod nodes;
pub mod resources;

pub use resources::{KubeResourceApi, ResourceApi, ResourceEvent, ResourceList};

/// Default user agent, derived from the package version
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
