pub mod config;
pub mod store;

pub use store::{ResourceKey, Store, object_key};
