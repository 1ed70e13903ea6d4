//! Messages exchanged between the dispatcher and an execution unit.
//!
//! Inbound there is a single `Execute` command. Outbound the unit streams
//! zero or more log and notification messages, then exactly one result.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::context::PluginSettings;
use crate::model::result::{ResultItem, SearchQuery};
use crate::plugin::manifest::EntryRef;
use crate::plugin::permission::Permission;

/// Snapshot of everything one execution needs, taken at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub plugin_id: String,
    pub entry: EntryRef,
    pub plugin_path: PathBuf,
    pub args: SearchQuery,
    pub permissions: HashSet<Permission>,
    pub settings: PluginSettings,
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum UnitCommand {
    Execute(ExecutionRequest),
}

/// Stops a running plugin from outside its thread.
pub type Interrupt = Box<dyn FnOnce() + Send>;

pub enum UnitEvent {
    /// Code is loaded; carries the hook used to interrupt it on teardown.
    Loaded { interrupt: Option<Interrupt> },
    Log { level: LogLevel, message: String },
    Notification { title: String, body: String },
    Result(Result<Vec<ResultItem>, EngineError>),
}

impl fmt::Debug for UnitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loaded { interrupt } => f
                .debug_struct("Loaded")
                .field("interruptible", &interrupt.is_some())
                .finish(),
            Self::Log { level, message } => f
                .debug_struct("Log")
                .field("level", level)
                .field("message", message)
                .finish(),
            Self::Notification { title, body } => f
                .debug_struct("Notification")
                .field("title", title)
                .field("body", body)
                .finish(),
            Self::Result(outcome) => f.debug_tuple("Result").field(outcome).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lenient parse for levels coming from guest code. Unknown names map to `Info`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }

    /// Re-emit a plugin log line through `tracing`, tagged with its source.
    pub fn emit(self, plugin_id: &str, message: &str) {
        match self {
            Self::Trace => tracing::trace!(plugin = plugin_id, "{message}"),
            Self::Debug => tracing::debug!(plugin = plugin_id, "{message}"),
            Self::Info => tracing::info!(plugin = plugin_id, "{message}"),
            Self::Warn => tracing::warn!(plugin = plugin_id, "{message}"),
            Self::Error => tracing::error!(plugin = plugin_id, "{message}"),
        }
    }
}
