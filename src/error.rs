//! Engine error types.

use crate::plugin::permission::Permission;

/// Errors surfaced to callers of the engine.
///
/// Execution failures (`PermissionDenied`, `Timeout`, `PluginException`) never
/// escape a dispatch; they travel inside an
/// [`ExecutionResult`](crate::model::result::ExecutionResult). They appear here
/// so that direct unit runs and Restricted API calls share one vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("PermissionDenied: plugin '{plugin_id}' lacks permission '{permission}'")]
    PermissionDenied {
        plugin_id: String,
        permission: Permission,
    },

    #[error("Timeout: plugin '{plugin_id}' exceeded {timeout_ms}ms")]
    Timeout { plugin_id: String, timeout_ms: u64 },

    #[error("PluginException: plugin '{plugin_id}': {message}")]
    PluginException { plugin_id: String, message: String },

    /// The plugin id is not registered.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// Registration rejected; every problem found is listed.
    #[error("invalid manifest{}: {}", quoted_id(.plugin_id), .problems.join("; "))]
    InvalidManifest {
        plugin_id: Option<String>,
        problems: Vec<String>,
    },

    #[error("plugin already registered: {0}")]
    AlreadyRegistered(String),

    /// Bundled plugins ship with the launcher and stay registered.
    #[error("core plugin cannot be unregistered: {0}")]
    CorePluginProtected(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    /// The plugin registry failed to load or persist state.
    #[error("registry error: {0}")]
    Registry(String),
}

impl EngineError {
    pub fn invalid_manifest(plugin_id: Option<&str>, problems: Vec<String>) -> Self {
        Self::InvalidManifest {
            plugin_id: plugin_id.filter(|id| !id.is_empty()).map(str::to_string),
            problems,
        }
    }

    pub fn registry(err: impl std::fmt::Display) -> Self {
        Self::Registry(err.to_string())
    }
}

fn quoted_id(plugin_id: &Option<String>) -> String {
    plugin_id
        .as_deref()
        .map(|id| format!(" '{id}'"))
        .unwrap_or_default()
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_display_carries_kind_and_permission() {
        let err = EngineError::PermissionDenied {
            plugin_id: "qr".to_string(),
            permission: Permission::Network,
        };
        let text = err.to_string();
        assert!(text.starts_with("PermissionDenied"));
        assert!(text.contains("'network'"));
        assert!(text.contains("'qr'"));
    }

    #[test]
    fn invalid_manifest_lists_every_problem() {
        let err = EngineError::invalid_manifest(
            Some("bad"),
            vec!["name is required".to_string(), "entry is required".to_string()],
        );
        assert_eq!(
            err.to_string(),
            "invalid manifest 'bad': name is required; entry is required"
        );

        let anonymous = EngineError::invalid_manifest(Some(""), vec!["id is required".to_string()]);
        assert_eq!(anonymous.to_string(), "invalid manifest: id is required");
    }

    #[test]
    fn core_plugin_protection_names_the_plugin() {
        let err = EngineError::CorePluginProtected("calculator".to_string());
        assert_eq!(err.to_string(), "core plugin cannot be unregistered: calculator");
    }
}
