//! In-memory plugin registrations, keyed by plugin id.
//!
//! All mutation goes through one `RwLock`, so the read-modify-write of the
//! crash counter and the quarantine decision happen under a single write
//! lock even when several units for the same plugin finish together.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::model::context::PluginContext;
use crate::model::result::SearchQuery;
use crate::plugin::manifest::PluginManifest;
use crate::plugin::permission::Permission;
use crate::plugin::protocol::ExecutionRequest;
use crate::plugin::registry::StoredState;

/// What a recorded failure did to the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub crash_count: u32,
    /// The failure pushed the plugin to the threshold and it is now disabled.
    pub quarantined: bool,
}

#[derive(Debug, Default)]
pub struct ContextStore {
    contexts: RwLock<HashMap<String, PluginContext>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, PluginContext>> {
        self.contexts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, PluginContext>> {
        self.contexts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate and insert a new plugin: disabled, nothing granted.
    ///
    /// Returns the manifest warnings.
    pub fn register(
        &self,
        manifest: PluginManifest,
        plugin_path: PathBuf,
    ) -> EngineResult<Vec<String>> {
        let warnings = manifest.validate()?;
        let mut contexts = self.write();
        if contexts.contains_key(&manifest.id) {
            return Err(EngineError::AlreadyRegistered(manifest.id));
        }
        let context = PluginContext::new(manifest, plugin_path);
        contexts.insert(context.id().to_string(), context);
        Ok(warnings)
    }

    /// Restore persisted state onto a registered plugin.
    pub fn restore(&self, plugin_id: &str, state: &StoredState) -> EngineResult<PluginContext> {
        self.update(plugin_id, |ctx| {
            ctx.is_enabled = state.enabled;
            ctx.granted_permissions.clear();
            ctx.grant(&state.granted);
            ctx.crash_count = state.crash_count;
            ctx.settings = state.settings.clone();
        })
    }

    pub fn unregister(&self, plugin_id: &str) -> EngineResult<PluginContext> {
        self.write()
            .remove(plugin_id)
            .ok_or_else(|| EngineError::NotFound(plugin_id.to_string()))
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.read().contains_key(plugin_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, plugin_id: &str) -> Option<PluginContext> {
        self.read().get(plugin_id).cloned()
    }

    /// Snapshot of every context, sorted by id.
    pub fn list(&self) -> Vec<PluginContext> {
        let mut contexts: Vec<PluginContext> = self.read().values().cloned().collect();
        contexts.sort_by(|a, b| a.id().cmp(b.id()));
        contexts
    }

    pub fn set_enabled(&self, plugin_id: &str, enabled: bool) -> EngineResult<PluginContext> {
        self.update(plugin_id, |ctx| ctx.is_enabled = enabled)
    }

    pub fn grant(
        &self,
        plugin_id: &str,
        permissions: &[Permission],
    ) -> EngineResult<PluginContext> {
        self.update(plugin_id, |ctx| ctx.grant(permissions))
    }

    pub fn revoke(
        &self,
        plugin_id: &str,
        permissions: &[Permission],
    ) -> EngineResult<PluginContext> {
        self.update(plugin_id, |ctx| ctx.revoke(permissions))
    }

    pub fn reset_crash_count(&self, plugin_id: &str) -> EngineResult<PluginContext> {
        self.update(plugin_id, |ctx| ctx.crash_count = 0)
    }

    /// Set or, with `None`, clear one setting.
    pub fn set_setting(
        &self,
        plugin_id: &str,
        key: &str,
        value: Option<toml::Value>,
    ) -> EngineResult<PluginContext> {
        self.update(plugin_id, |ctx| match value {
            Some(value) => {
                ctx.settings.insert(key.to_string(), value);
            }
            None => {
                ctx.settings.remove(key);
            }
        })
    }

    pub fn record_success(&self, plugin_id: &str, elapsed_ms: u64) -> EngineResult<PluginContext> {
        self.update(plugin_id, |ctx| ctx.record_success(elapsed_ms))
    }

    /// Count one failure and quarantine the plugin once it reaches `threshold`.
    pub fn record_failure(&self, plugin_id: &str, threshold: u32) -> EngineResult<FailureOutcome> {
        let mut contexts = self.write();
        let ctx = contexts
            .get_mut(plugin_id)
            .ok_or_else(|| EngineError::NotFound(plugin_id.to_string()))?;

        let crash_count = ctx.record_failure();
        let quarantined = crash_count >= threshold;
        if quarantined {
            ctx.is_enabled = false;
        }
        Ok(FailureOutcome {
            crash_count,
            quarantined,
        })
    }

    /// Build one request per enabled plugin whose trigger prefixes `query`.
    ///
    /// Sorted by plugin id. When several triggers of one plugin match, the
    /// longest wins; a plugin is never dispatched twice for one query.
    pub fn dispatch_requests(&self, query: &str, timeout: Duration) -> Vec<ExecutionRequest> {
        let contexts = self.read();
        let mut requests: Vec<ExecutionRequest> = contexts
            .values()
            .filter(|ctx| ctx.is_enabled)
            .filter_map(|ctx| {
                let args = ctx
                    .manifest
                    .triggers
                    .iter()
                    .filter_map(|trigger| SearchQuery::match_trigger(query, trigger))
                    .max_by_key(|matched| matched.keyword.chars().count())?;
                Some(ExecutionRequest {
                    plugin_id: ctx.id().to_string(),
                    entry: ctx.manifest.entry_ref(),
                    plugin_path: ctx.plugin_path.clone(),
                    args,
                    permissions: ctx.granted_permissions.clone(),
                    settings: ctx.settings.clone(),
                    timeout,
                })
            })
            .collect();
        requests.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        requests
    }

    fn update(
        &self,
        plugin_id: &str,
        apply: impl FnOnce(&mut PluginContext),
    ) -> EngineResult<PluginContext> {
        let mut contexts = self.write();
        let ctx = contexts
            .get_mut(plugin_id)
            .ok_or_else(|| EngineError::NotFound(plugin_id.to_string()))?;
        apply(ctx);
        Ok(ctx.clone())
    }
}
