//! Per-plugin health derived from execution outcomes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockWriteGuard};

use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::model::context::{PluginContext, unix_millis};
use crate::model::result::ExecutionResult;
use crate::plugin::store::ContextStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Warning,
    Error,
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub plugin_id: String,
    pub state: HealthState,
    pub message: Option<String>,
    pub crash_count: u32,
    pub last_error: Option<String>,
    pub checked_at: Option<u64>,
}

#[derive(Debug, Clone)]
struct HealthRecord {
    state: HealthState,
    last_error: Option<String>,
    quarantined: bool,
    checked_at: Option<u64>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            state: HealthState::Unknown,
            last_error: None,
            quarantined: false,
            checked_at: None,
        }
    }
}

/// Applies execution outcomes to the context store and remembers why a
/// plugin is in its current state.
#[derive(Debug)]
pub struct HealthTracker {
    records: RwLock<HashMap<String, HealthRecord>>,
    crash_threshold: u32,
}

impl HealthTracker {
    pub fn new(crash_threshold: u32) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            crash_threshold: crash_threshold.max(1),
        }
    }

    fn records(&self) -> RwLockWriteGuard<'_, HashMap<String, HealthRecord>> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fold one result into the store and the health record.
    ///
    /// Plugins unregistered while their unit ran are ignored.
    pub fn record(&self, store: &ContextStore, result: &ExecutionResult) -> Option<HealthState> {
        let plugin_id = result.plugin_id.as_str();
        if result.success {
            store.record_success(plugin_id, result.execution_time_ms).ok()?;
            let mut records = self.records();
            let record = records.entry(plugin_id.to_string()).or_default();
            record.state = HealthState::Healthy;
            record.checked_at = Some(unix_millis());
            return Some(record.state);
        }

        let outcome = store.record_failure(plugin_id, self.crash_threshold).ok()?;
        let mut records = self.records();
        let record = records.entry(plugin_id.to_string()).or_default();
        record.last_error = result.error_message();
        record.checked_at = Some(unix_millis());
        if outcome.quarantined {
            record.quarantined = true;
            record.state = HealthState::Error;
            tracing::warn!(
                plugin = plugin_id,
                crash_count = outcome.crash_count,
                "plugin quarantined"
            );
        } else {
            record.state = HealthState::Warning;
        }
        tracing::debug!(
            plugin = plugin_id,
            crash_count = outcome.crash_count,
            error = record.last_error.as_deref().unwrap_or_default(),
            "execution failed"
        );
        Some(record.state)
    }

    /// Forget the quarantine after a user re-enable. The state stays unknown
    /// until the next execution.
    pub fn clear_quarantine(&self, plugin_id: &str) {
        let mut records = self.records();
        let record = records.entry(plugin_id.to_string()).or_default();
        record.quarantined = false;
        record.state = HealthState::Unknown;
    }

    /// Store the outcome of an active check. `problem` is `None` when it passed.
    pub fn mark_checked(&self, plugin_id: &str, problem: Option<String>) {
        let mut records = self.records();
        let record = records.entry(plugin_id.to_string()).or_default();
        record.checked_at = Some(unix_millis());
        match problem {
            Some(problem) => {
                record.state = HealthState::Error;
                record.last_error = Some(problem);
            }
            None if record.state == HealthState::Error && !record.quarantined => {
                record.state = HealthState::Unknown;
            }
            None => {}
        }
    }

    pub fn forget(&self, plugin_id: &str) {
        self.records().remove(plugin_id);
    }

    pub fn is_quarantined(&self, plugin_id: &str) -> bool {
        self.records()
            .get(plugin_id)
            .is_some_and(|record| record.quarantined)
    }

    pub fn status(&self, store: &ContextStore, plugin_id: &str) -> EngineResult<HealthStatus> {
        let ctx = store
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(plugin_id.to_string()))?;
        let record = self.records().get(plugin_id).cloned().unwrap_or_default();
        Ok(self.describe(&ctx, &record))
    }

    fn describe(&self, ctx: &PluginContext, record: &HealthRecord) -> HealthStatus {
        let (state, message) = if !ctx.is_enabled {
            if record.quarantined {
                (
                    HealthState::Error,
                    Some(format!(
                        "quarantined after {} failures; re-enable to retry",
                        ctx.crash_count
                    )),
                )
            } else if record.state == HealthState::Error {
                (HealthState::Error, record.last_error.clone())
            } else {
                (HealthState::Warning, Some("disabled by user".to_string()))
            }
        } else {
            let message = match record.state {
                HealthState::Healthy => None,
                HealthState::Unknown => Some("not executed yet".to_string()),
                HealthState::Warning | HealthState::Error => record.last_error.clone(),
            };
            (record.state, message)
        };

        HealthStatus {
            plugin_id: ctx.id().to_string(),
            state,
            message,
            crash_count: ctx.crash_count,
            last_error: record.last_error.clone(),
            checked_at: record.checked_at,
        }
    }
}
