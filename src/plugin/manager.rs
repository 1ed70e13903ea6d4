use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::model::config::{AppConfig, SandboxConfig};
use crate::model::context::PluginContext;
use crate::model::result::{ExecutionResult, ResultItem};
use crate::plugin::builtin::BuiltinCatalog;
use crate::plugin::dispatcher::{self, Dispatcher};
use crate::plugin::health::{HealthStatus, HealthTracker};
use crate::plugin::host_fns::CapabilityHost;
use crate::plugin::manifest::{EntryRef, PluginManifest};
use crate::plugin::monitor::{MetricsSnapshot, Monitor};
use crate::plugin::permission::Permission;
use crate::plugin::registry::{InstalledPlugin, LoadError, PluginRegistry, StoredState};
use crate::plugin::runtime::{PluginLoader, SandboxLoader};
use crate::plugin::store::ContextStore;

/// Entry point for the launcher: owns the registrations, dispatches
/// queries, and persists every state change through the registry.
pub struct PluginManager {
    sandbox: SandboxConfig,
    max_results: usize,
    store: Arc<ContextStore>,
    health: Arc<HealthTracker>,
    monitor: Arc<Monitor>,
    registry: Arc<dyn PluginRegistry>,
    builtins: BuiltinCatalog,
    dispatcher: Dispatcher,
    load_errors: Vec<LoadError>,
}

impl PluginManager {
    /// Load installed and bundled plugins and get ready to dispatch.
    pub fn start(
        config: &AppConfig,
        registry: Arc<dyn PluginRegistry>,
        host: Arc<dyn CapabilityHost>,
        builtins: BuiltinCatalog,
    ) -> Self {
        let loader: Arc<dyn PluginLoader> = Arc::new(SandboxLoader::new(
            builtins.clone(),
            config.sandbox.max_memory_pages,
        ));
        Self::with_loader(config, registry, host, builtins, loader)
    }

    pub fn with_loader(
        config: &AppConfig,
        registry: Arc<dyn PluginRegistry>,
        host: Arc<dyn CapabilityHost>,
        builtins: BuiltinCatalog,
        loader: Arc<dyn PluginLoader>,
    ) -> Self {
        let store = Arc::new(ContextStore::new());
        let health = Arc::new(HealthTracker::new(config.sandbox.crash_threshold()));
        let monitor = Arc::new(Monitor::new(&config.monitor));
        let dispatcher = Dispatcher::new(
            store.clone(),
            health.clone(),
            monitor.clone(),
            loader,
            host,
            config.sandbox.timeout(),
        );

        let mut manager = Self {
            sandbox: config.sandbox.clone(),
            max_results: config.search.max_results,
            store,
            health,
            monitor,
            registry,
            builtins,
            dispatcher,
            load_errors: Vec::new(),
        };
        manager.load_installed();
        manager.load_bundled(&config.plugins.builtin);

        tracing::info!(
            plugins = manager.store.len(),
            errors = manager.load_errors.len(),
            "plugin manager started"
        );
        manager
    }

    fn load_installed(&mut self) {
        let discovered = match self.registry.load_all() {
            Ok(discovered) => discovered,
            Err(err) => {
                tracing::error!("plugin registry unavailable: {err:#}");
                self.load_errors.push(LoadError {
                    plugin_id: "registry".to_string(),
                    message: format!("{err:#}"),
                });
                return;
            }
        };

        for entry in discovered {
            let result = entry.and_then(|installed| {
                let plugin_id = installed.manifest.id.clone();
                self.register_installed(installed).map_err(|err| LoadError {
                    plugin_id,
                    message: err.to_string(),
                })
            });
            if let Err(err) = result {
                tracing::warn!(plugin = %err.plugin_id, "plugin not loaded: {}", err.message);
                self.load_errors.push(err);
            }
        }
    }

    fn register_installed(&self, installed: InstalledPlugin) -> EngineResult<()> {
        let plugin_id = installed.manifest.id.clone();
        let warnings = self.store.register(installed.manifest, installed.plugin_path)?;
        log_warnings(&plugin_id, &warnings);
        if let Some(state) = installed.state {
            self.store.restore(&plugin_id, &state)?;
        }
        Ok(())
    }

    fn load_bundled(&mut self, names: &[String]) {
        for name in names {
            if let Err(err) = self.register_bundled(name) {
                tracing::warn!(plugin = %name, "bundled plugin not loaded: {err}");
                self.load_errors.push(LoadError {
                    plugin_id: name.clone(),
                    message: err.to_string(),
                });
            }
        }
    }

    /// Bundled plugins start enabled with their declared permissions unless
    /// the user already changed them.
    fn register_bundled(&self, name: &str) -> EngineResult<()> {
        let manifest = self
            .builtins
            .manifest(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("bundled plugin '{name}'")))?;
        let plugin_id = manifest.id.clone();
        let state = self
            .registry
            .stored_state(&plugin_id)
            .map_err(EngineError::registry)?
            .unwrap_or_else(|| StoredState {
                enabled: true,
                granted: manifest.permissions.clone(),
                ..StoredState::default()
            });

        let warnings = self.store.register(manifest, PathBuf::new())?;
        log_warnings(&plugin_id, &warnings);
        self.store.restore(&plugin_id, &state)?;
        Ok(())
    }

    fn persist(&self, ctx: &PluginContext) -> EngineResult<()> {
        self.registry.save(ctx).map_err(EngineError::registry)
    }

    /// Apply `change` and save the result. When saving fails the in-memory
    /// context is put back the way it was.
    fn commit(
        &self,
        plugin_id: &str,
        change: impl FnOnce(&ContextStore) -> EngineResult<PluginContext>,
    ) -> EngineResult<PluginContext> {
        let before = self
            .store
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(plugin_id.to_string()))?;
        let ctx = change(&self.store)?;
        if let Err(err) = self.persist(&ctx) {
            tracing::warn!(plugin = plugin_id, "state not saved, rolling back: {err}");
            self.store.restore(plugin_id, &StoredState::from_context(&before))?;
            return Err(err);
        }
        Ok(ctx)
    }

    /// Bundled plugins ship with the launcher and cannot be removed.
    fn is_core(&self, ctx: &PluginContext) -> bool {
        match ctx.manifest.entry_ref() {
            EntryRef::Builtin(name) => self.builtins.manifest(&name).is_some(),
            EntryRef::Wasm(_) => false,
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Per-plugin outcomes for `query`, sorted by plugin id.
    pub fn execute(&self, query: &str) -> Vec<ExecutionResult> {
        let results = self.dispatcher.execute(query);
        for result in results.iter().filter(|result| !result.success) {
            let Some(ctx) = self.store.get(&result.plugin_id) else {
                continue;
            };
            if let Err(err) = self.persist(&ctx) {
                tracing::warn!(plugin = %result.plugin_id, "failed to persist crash count: {err}");
            }
        }
        results
    }

    /// Aggregated items from every plugin that succeeded.
    pub fn search(&self, query: &str) -> Vec<ResultItem> {
        dispatcher::collect_items(self.execute(query), self.max_results)
    }

    // ── Registration ─────────────────────────────────────────────

    /// Register a new plugin. It starts disabled with nothing granted.
    pub fn register(
        &self,
        manifest: PluginManifest,
        plugin_path: PathBuf,
    ) -> EngineResult<Vec<String>> {
        let plugin_id = manifest.id.clone();
        let warnings = self.store.register(manifest, plugin_path)?;
        log_warnings(&plugin_id, &warnings);
        if let Some(ctx) = self.store.get(&plugin_id) {
            if let Err(err) = self.persist(&ctx) {
                tracing::warn!(plugin = %plugin_id, "registration not saved: {err}");
                self.store.unregister(&plugin_id)?;
                return Err(err);
            }
        }
        tracing::info!(plugin = %plugin_id, "plugin registered");
        Ok(warnings)
    }

    /// Remove a plugin and its persisted files. Bundled plugins are refused.
    pub fn unregister(&self, plugin_id: &str) -> EngineResult<()> {
        let ctx = self
            .store
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(plugin_id.to_string()))?;
        if self.is_core(&ctx) {
            return Err(EngineError::CorePluginProtected(plugin_id.to_string()));
        }
        self.registry.remove(plugin_id).map_err(EngineError::registry)?;
        self.store.unregister(plugin_id)?;
        self.health.forget(plugin_id);
        self.monitor.forget(plugin_id);
        tracing::info!(plugin = plugin_id, "plugin unregistered");
        Ok(())
    }

    pub fn enable(&self, plugin_id: &str) -> EngineResult<()> {
        let was_quarantined = self.health.is_quarantined(plugin_id);
        let reset_crashes = self.sandbox.reset_crashes_on_enable;
        let ctx = self.commit(plugin_id, |store| {
            let ctx = store.set_enabled(plugin_id, true)?;
            if reset_crashes {
                store.reset_crash_count(plugin_id)
            } else {
                Ok(ctx)
            }
        })?;
        if was_quarantined {
            self.health.clear_quarantine(plugin_id);
            tracing::info!(
                plugin = plugin_id,
                crash_count = ctx.crash_count,
                "plugin re-enabled after quarantine"
            );
        }
        Ok(())
    }

    pub fn disable(&self, plugin_id: &str) -> EngineResult<()> {
        self.commit(plugin_id, |store| store.set_enabled(plugin_id, false)).map(|_| ())
    }

    pub fn enable_many(&self, plugin_ids: &[&str]) -> Vec<(String, EngineResult<()>)> {
        plugin_ids
            .iter()
            .map(|id| (id.to_string(), self.enable(id)))
            .collect()
    }

    pub fn disable_many(&self, plugin_ids: &[&str]) -> Vec<(String, EngineResult<()>)> {
        plugin_ids
            .iter()
            .map(|id| (id.to_string(), self.disable(id)))
            .collect()
    }

    /// Grant permissions; anything the manifest does not declare is dropped.
    pub fn grant(&self, plugin_id: &str, permissions: &[Permission]) -> EngineResult<()> {
        let ctx = self.commit(plugin_id, |store| store.grant(plugin_id, permissions))?;
        let ignored: Vec<&Permission> = permissions
            .iter()
            .filter(|permission| !ctx.manifest.declares(**permission))
            .collect();
        if !ignored.is_empty() {
            tracing::warn!(plugin = plugin_id, ?ignored, "undeclared permissions not granted");
        }
        Ok(())
    }

    pub fn revoke(&self, plugin_id: &str, permissions: &[Permission]) -> EngineResult<()> {
        self.commit(plugin_id, |store| store.revoke(plugin_id, permissions)).map(|_| ())
    }

    pub fn reset_crash_count(&self, plugin_id: &str) -> EngineResult<()> {
        self.commit(plugin_id, |store| store.reset_crash_count(plugin_id)).map(|_| ())
    }

    // ── Settings ─────────────────────────────────────────────────

    /// Store one user setting for a plugin; `None` removes it.
    pub fn set_setting(
        &self,
        plugin_id: &str,
        key: &str,
        value: Option<toml::Value>,
    ) -> EngineResult<()> {
        if key.trim().is_empty() {
            return Err(EngineError::InvalidSetting("setting name is empty".to_string()));
        }
        self.commit(plugin_id, |store| store.set_setting(plugin_id, key, value))?;
        tracing::debug!(plugin = plugin_id, key, "setting updated");
        Ok(())
    }

    pub fn get_setting(&self, plugin_id: &str, key: &str) -> EngineResult<Option<toml::Value>> {
        let ctx = self
            .store
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(plugin_id.to_string()))?;
        Ok(ctx.settings.get(key).cloned())
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn context(&self, plugin_id: &str) -> Option<PluginContext> {
        self.store.get(plugin_id)
    }

    pub fn contexts(&self) -> Vec<PluginContext> {
        self.store.list()
    }

    pub fn get_health(&self, plugin_id: &str) -> EngineResult<HealthStatus> {
        self.health.status(&self.store, plugin_id)
    }

    /// Actively verify that the plugin's code can still be loaded.
    pub fn check_health(&self, plugin_id: &str) -> EngineResult<HealthStatus> {
        let ctx = self
            .store
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(plugin_id.to_string()))?;
        let problem = match ctx.manifest.entry_ref() {
            EntryRef::Builtin(name) if !self.builtins.contains(&name) => {
                Some(format!("builtin handler '{name}' is not available"))
            }
            EntryRef::Builtin(_) => None,
            EntryRef::Wasm(path) => {
                let wasm_path = ctx.plugin_path.join(&path);
                (!wasm_path.is_file())
                    .then(|| format!("missing wasm entry: {}", wasm_path.display()))
            }
        };
        self.health.mark_checked(plugin_id, problem);
        self.get_health(plugin_id)
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.monitor.snapshot()
    }

    pub fn status_report(&self) -> String {
        self.monitor.status_report()
    }

    pub fn clear_metrics(&self) {
        self.monitor.clear();
    }

    pub fn load_errors(&self) -> &[LoadError] {
        &self.load_errors
    }

    // ── Notifications ────────────────────────────────────────────

    pub fn plugin_count(&self) -> usize {
        self.store.len()
    }

    pub fn startup_notifications(&self) -> Vec<String> {
        if self.store.is_empty() && self.load_errors.is_empty() {
            return Vec::new();
        }

        let mut notices = vec![self.summary_notification()];
        notices.extend(self.error_notifications());
        notices
    }

    pub fn summary_notification(&self) -> String {
        let contexts = self.store.list();
        let enabled = contexts.iter().filter(|ctx| ctx.is_enabled).count();
        format!(
            "plugins: {} registered, {enabled} enabled, {} errors",
            contexts.len(),
            self.load_errors.len()
        )
    }

    pub fn error_notifications(&self) -> Vec<String> {
        self.load_errors
            .iter()
            .map(|err| format!("plugin {}: {}", err.plugin_id, err.message))
            .collect()
    }

    pub fn list_notifications(&self) -> Vec<String> {
        let contexts = self.store.list();
        if contexts.is_empty() {
            return vec!["plugins: none registered".to_string()];
        }

        contexts
            .iter()
            .map(|ctx| {
                let status = if ctx.is_enabled { "enabled" } else { "disabled" };
                let grants: Vec<&str> = ctx
                    .sorted_grants()
                    .into_iter()
                    .map(Permission::as_str)
                    .collect();
                format!(
                    "plugin {} v{} [{status}] triggers: {} grants: [{}] crashes: {}",
                    ctx.id(),
                    ctx.manifest.version,
                    ctx.manifest.triggers.join(" "),
                    grants.join(", "),
                    ctx.crash_count
                )
            })
            .collect()
    }
}

fn log_warnings(plugin_id: &str, warnings: &[String]) {
    for warning in warnings {
        tracing::warn!(plugin = plugin_id, "manifest: {warning}");
    }
}
