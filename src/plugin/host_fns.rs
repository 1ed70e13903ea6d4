//! Restricted API surface handed to plugin code.
//!
//! [`PluginApi`] is the only way a plugin reaches a privileged operation.
//! Every call is written to the audit log, checked against the permission
//! snapshot taken at dispatch, and only then forwarded to the
//! [`CapabilityHost`]. Notifications skip the permission check and travel to
//! the dispatcher as side-channel messages. The plugin's own settings are
//! readable without a permission.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

use crate::error::EngineError;
use crate::model::context::PluginSettings;
use crate::plugin::permission::{self, Operation, Permission};
use crate::plugin::protocol::{LogLevel, UnitEvent};

pub const AUDIT_TARGET: &str = "launchbox::audit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// One privileged request, as forwarded to the capability host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum CapabilityCall {
    ClipboardRead,
    ClipboardWrite { text: String },
    FileRead { path: String },
    FileWrite { path: String, contents: String },
    HttpRequest(HttpRequest),
    ShellExec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Notify {
        title: String,
        #[serde(default)]
        body: String,
    },
}

impl CapabilityCall {
    pub fn operation(&self) -> Operation {
        match self {
            Self::ClipboardRead => Operation::ClipboardRead,
            Self::ClipboardWrite { .. } => Operation::ClipboardWrite,
            Self::FileRead { .. } => Operation::FileRead,
            Self::FileWrite { .. } => Operation::FileWrite,
            Self::HttpRequest(_) => Operation::HttpRequest,
            Self::ShellExec { .. } => Operation::ShellExec,
            Self::Notify { .. } => Operation::Notify,
        }
    }

    fn audit_args(&self) -> String {
        match self {
            Self::ClipboardRead => String::new(),
            Self::ClipboardWrite { text } => format!("text_len={}", text.len()),
            Self::FileRead { path } => format!("path={path}"),
            Self::FileWrite { path, contents } => {
                format!("path={path} contents_len={}", contents.len())
            }
            Self::HttpRequest(request) => format!("{} {}", request.method, request.url),
            Self::ShellExec { program, args } => format!("{program} {}", args.join(" ")),
            Self::Notify { title, .. } => format!("title={title}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CapabilityReply {
    Done,
    Text(String),
    Http(HttpResponse),
    Shell(ShellOutput),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("capability '{0}' is not supported by this host")]
    Unsupported(Operation),
    #[error("{0}")]
    Failed(String),
}

/// Performs privileged operations once the gate has authorised them.
pub trait CapabilityHost: Send + Sync {
    fn invoke(&self, plugin_id: &str, call: &CapabilityCall)
    -> Result<CapabilityReply, HostError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("PermissionDenied: plugin '{plugin_id}' lacks permission '{permission}'")]
    PermissionDenied {
        plugin_id: String,
        permission: Permission,
    },
    #[error("capability host failed: {0}")]
    Host(#[from] HostError),
    #[error("execution was cancelled")]
    Cancelled,
    #[error("unexpected reply to {0}")]
    UnexpectedReply(Operation),
}

impl ApiError {
    pub fn into_engine_error(self, plugin_id: &str) -> EngineError {
        match self {
            Self::PermissionDenied {
                plugin_id,
                permission,
            } => EngineError::PermissionDenied {
                plugin_id,
                permission,
            },
            other => EngineError::PluginException {
                plugin_id: plugin_id.to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[derive(Clone)]
pub struct PluginApi {
    plugin_id: String,
    permissions: Arc<HashSet<Permission>>,
    settings: Arc<PluginSettings>,
    host: Arc<dyn CapabilityHost>,
    events: Sender<UnitEvent>,
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for PluginApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginApi")
            .field("plugin_id", &self.plugin_id)
            .field("permissions", &self.permissions)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PluginApi {
    pub(crate) fn new(
        plugin_id: String,
        permissions: HashSet<Permission>,
        settings: PluginSettings,
        host: Arc<dyn CapabilityHost>,
        events: Sender<UnitEvent>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            plugin_id,
            permissions: Arc::new(permissions),
            settings: Arc::new(settings),
            host,
            events,
            cancelled,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// A user setting for this plugin, as it stood when the query was dispatched.
    pub fn setting(&self, key: &str) -> Option<&toml::Value> {
        self.settings.get(key)
    }

    /// Audit, gate, then forward one capability call.
    pub fn call(&self, call: CapabilityCall) -> Result<CapabilityReply, ApiError> {
        let operation = call.operation();
        tracing::info!(
            target: AUDIT_TARGET,
            plugin = %self.plugin_id,
            operation = %operation,
            args = %call.audit_args(),
            "capability call"
        );

        if self.is_cancelled() {
            return Err(ApiError::Cancelled);
        }

        if !permission::is_authorized(&self.permissions, operation) {
            let permission = permission::required_permission(operation)
                .unwrap_or(Permission::Notification);
            tracing::warn!(
                plugin = %self.plugin_id,
                operation = %operation,
                permission = %permission,
                "capability denied"
            );
            return Err(ApiError::PermissionDenied {
                plugin_id: self.plugin_id.clone(),
                permission,
            });
        }

        if let CapabilityCall::Notify { title, body } = call {
            let _ = self.events.send(UnitEvent::Notification { title, body });
            return Ok(CapabilityReply::Done);
        }

        Ok(self.host.invoke(&self.plugin_id, &call)?)
    }

    pub fn read_clipboard(&self) -> Result<String, ApiError> {
        expect_text(self.call(CapabilityCall::ClipboardRead)?, Operation::ClipboardRead)
    }

    pub fn write_clipboard(&self, text: impl Into<String>) -> Result<(), ApiError> {
        self.call(CapabilityCall::ClipboardWrite { text: text.into() })
            .map(|_| ())
    }

    pub fn read_file(&self, path: impl Into<String>) -> Result<String, ApiError> {
        expect_text(
            self.call(CapabilityCall::FileRead { path: path.into() })?,
            Operation::FileRead,
        )
    }

    pub fn write_file(
        &self,
        path: impl Into<String>,
        contents: impl Into<String>,
    ) -> Result<(), ApiError> {
        self.call(CapabilityCall::FileWrite {
            path: path.into(),
            contents: contents.into(),
        })
        .map(|_| ())
    }

    pub fn http_request(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        match self.call(CapabilityCall::HttpRequest(request))? {
            CapabilityReply::Http(response) => Ok(response),
            _ => Err(ApiError::UnexpectedReply(Operation::HttpRequest)),
        }
    }

    pub fn shell_exec(
        &self,
        program: impl Into<String>,
        args: Vec<String>,
    ) -> Result<ShellOutput, ApiError> {
        match self.call(CapabilityCall::ShellExec {
            program: program.into(),
            args,
        })? {
            CapabilityReply::Shell(output) => Ok(output),
            _ => Err(ApiError::UnexpectedReply(Operation::ShellExec)),
        }
    }

    pub fn notify(
        &self,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<(), ApiError> {
        self.call(CapabilityCall::Notify {
            title: title.into(),
            body: body.into(),
        })
        .map(|_| ())
    }

    /// Side-channel log line; no permission involved.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.events.send(UnitEvent::Log {
            level,
            message: message.into(),
        });
    }
}

fn expect_text(reply: CapabilityReply, operation: Operation) -> Result<String, ApiError> {
    match reply {
        CapabilityReply::Text(text) => Ok(text),
        _ => Err(ApiError::UnexpectedReply(operation)),
    }
}
