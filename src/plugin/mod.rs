pub mod builtin;
pub mod dispatcher;
pub mod health;
pub mod host_fns;
pub mod manager;
pub mod manifest;
pub mod monitor;
pub mod permission;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod store;
#[cfg(feature = "plugins")]
pub mod wasm;

pub use manager::PluginManager;
