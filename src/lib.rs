//! Sandboxed plugin execution for the launchbox quick-launcher.
//!
//! A query is matched against plugin triggers, each matching plugin runs in
//! its own execution unit under a deadline, and privileged operations go
//! through a permission-gated API. See [`plugin::PluginManager`].

pub mod error;
pub mod model;
pub mod plugin;

pub use error::{EngineError, EngineResult};
pub use model::config::AppConfig;
pub use model::context::PluginContext;
pub use model::result::{ExecutionResult, ResultAction, ResultItem, SearchQuery};
pub use plugin::PluginManager;
pub use plugin::builtin::BuiltinCatalog;
pub use plugin::host_fns::{CapabilityCall, CapabilityHost, CapabilityReply, HostError, PluginApi};
pub use plugin::manifest::PluginManifest;
pub use plugin::permission::Permission;
