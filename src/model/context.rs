use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::plugin::manifest::PluginManifest;
use crate::plugin::permission::Permission;

/// Per-plugin user settings, keyed by setting name.
pub type PluginSettings = BTreeMap<String, toml::Value>;

/// Registration state for one plugin, owned by the context store.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginContext {
    pub manifest: PluginManifest,
    pub is_enabled: bool,
    /// Always a subset of `manifest.permissions`.
    pub granted_permissions: HashSet<Permission>,
    pub crash_count: u32,
    pub execution_count: u64,
    pub last_execution_time: Option<u64>,
    pub average_execution_time: Option<f64>,
    pub last_used: Option<u64>,
    pub settings: PluginSettings,
    pub plugin_path: PathBuf,
}

impl PluginContext {
    pub fn new(manifest: PluginManifest, plugin_path: PathBuf) -> Self {
        Self {
            manifest,
            is_enabled: false,
            granted_permissions: HashSet::new(),
            crash_count: 0,
            execution_count: 0,
            last_execution_time: None,
            average_execution_time: None,
            last_used: None,
            settings: PluginSettings::new(),
            plugin_path,
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Grant the subset of `permissions` the manifest declares.
    pub fn grant(&mut self, permissions: &[Permission]) {
        self.granted_permissions.extend(
            permissions
                .iter()
                .copied()
                .filter(|permission| self.manifest.declares(*permission)),
        );
    }

    pub fn revoke(&mut self, permissions: &[Permission]) {
        for permission in permissions {
            self.granted_permissions.remove(permission);
        }
    }

    /// Fold a successful run into the running mean.
    pub fn record_success(&mut self, elapsed_ms: u64) {
        self.execution_count = self.execution_count.saturating_add(1);
        self.last_execution_time = Some(elapsed_ms);
        let previous = self.average_execution_time.unwrap_or(0.0);
        let count = self.execution_count as f64;
        self.average_execution_time = Some(previous + (elapsed_ms as f64 - previous) / count);
        self.last_used = Some(unix_millis());
    }

    pub fn record_failure(&mut self) -> u32 {
        self.crash_count = self.crash_count.saturating_add(1);
        self.last_used = Some(unix_millis());
        self.crash_count
    }

    pub fn sorted_grants(&self) -> Vec<Permission> {
        let mut grants: Vec<Permission> = self.granted_permissions.iter().copied().collect();
        grants.sort();
        grants
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(permissions: Vec<Permission>) -> PluginContext {
        PluginContext::new(
            PluginManifest {
                id: "demo".to_string(),
                name: "Demo".to_string(),
                version: "1.0.0".to_string(),
                description: None,
                author: None,
                permissions,
                triggers: vec!["demo:".to_string()],
                entry: "builtin:demo".to_string(),
            },
            PathBuf::new(),
        )
    }

    #[test]
    fn new_context_starts_disabled_with_no_grants() {
        let ctx = context(vec![Permission::Network]);
        assert!(!ctx.is_enabled);
        assert!(ctx.granted_permissions.is_empty());
        assert_eq!(ctx.crash_count, 0);
    }

    #[test]
    fn grants_are_clipped_to_declared_permissions() {
        let mut ctx = context(vec![Permission::Network, Permission::ReadFile]);
        ctx.grant(&[Permission::Network, Permission::Shell]);
        assert_eq!(ctx.sorted_grants(), vec![Permission::Network]);

        ctx.revoke(&[Permission::Network, Permission::ReadFile]);
        assert!(ctx.granted_permissions.is_empty());
    }

    #[test]
    fn running_mean_tracks_successes() {
        let mut ctx = context(Vec::new());
        ctx.record_success(10);
        ctx.record_success(20);
        ctx.record_success(30);
        assert_eq!(ctx.execution_count, 3);
        assert_eq!(ctx.last_execution_time, Some(30));
        let average = ctx.average_execution_time.expect("average");
        assert!((average - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failures_only_increase_crash_count() {
        let mut ctx = context(Vec::new());
        assert_eq!(ctx.record_failure(), 1);
        ctx.record_success(5);
        assert_eq!(ctx.record_failure(), 2);
        assert_eq!(ctx.crash_count, 2);
    }
}
