//! Plugin persistence: installed manifests plus per-plugin state.
//!
//! On disk every plugin lives in `<plugins_dir>/<id>/plugin.toml`; enabled
//! flags, grants, crash counts and settings are kept together in one `state.toml`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context as _, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::model::context::{PluginContext, PluginSettings};
use crate::plugin::manifest::{MANIFEST_FILE, PluginManifest};
use crate::plugin::permission::Permission;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredState {
    pub enabled: bool,
    pub granted: Vec<Permission>,
    pub crash_count: u32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: PluginSettings,
}

impl StoredState {
    pub fn from_context(ctx: &PluginContext) -> Self {
        Self {
            enabled: ctx.is_enabled,
            granted: ctx.sorted_grants(),
            crash_count: ctx.crash_count,
            settings: ctx.settings.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstalledPlugin {
    pub manifest: PluginManifest,
    pub plugin_path: PathBuf,
    pub state: Option<StoredState>,
}

/// A plugin directory that could not be turned into a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub plugin_id: String,
    pub message: String,
}

pub trait PluginRegistry: Send + Sync {
    /// Every installed plugin; one bad plugin does not fail the rest.
    fn load_all(&self) -> Result<Vec<std::result::Result<InstalledPlugin, LoadError>>>;

    /// Persisted state for a plugin that is not installed on disk (bundled ones).
    fn stored_state(&self, plugin_id: &str) -> Result<Option<StoredState>>;

    fn save(&self, ctx: &PluginContext) -> Result<()>;

    /// Forget a plugin: its state and, when installed, its files.
    fn remove(&self, plugin_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    installed: Vec<InstalledPlugin>,
    states: HashMap<String, StoredState>,
}

/// Registry without persistence, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    inner: Mutex<MemoryInner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn install(&self, manifest: PluginManifest, plugin_path: PathBuf) {
        self.inner().installed.push(InstalledPlugin {
            manifest,
            plugin_path,
            state: None,
        });
    }

    pub fn set_state(&self, plugin_id: &str, state: StoredState) {
        self.inner().states.insert(plugin_id.to_string(), state);
    }

    pub fn state(&self, plugin_id: &str) -> Option<StoredState> {
        self.inner().states.get(plugin_id).cloned()
    }
}

impl PluginRegistry for MemoryRegistry {
    fn load_all(&self) -> Result<Vec<std::result::Result<InstalledPlugin, LoadError>>> {
        let inner = self.inner();
        Ok(inner
            .installed
            .iter()
            .map(|installed| {
                Ok(InstalledPlugin {
                    state: inner.states.get(&installed.manifest.id).cloned(),
                    ..installed.clone()
                })
            })
            .collect())
    }

    fn stored_state(&self, plugin_id: &str) -> Result<Option<StoredState>> {
        Ok(self.state(plugin_id))
    }

    fn save(&self, ctx: &PluginContext) -> Result<()> {
        self.set_state(ctx.id(), StoredState::from_context(ctx));
        Ok(())
    }

    fn remove(&self, plugin_id: &str) -> Result<()> {
        let mut inner = self.inner();
        inner.states.remove(plugin_id);
        inner
            .installed
            .retain(|installed| installed.manifest.id != plugin_id);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    plugins: BTreeMap<String, StoredState>,
}

/// Registry backed by a plugins directory and a TOML state file.
#[derive(Debug)]
pub struct TomlRegistry {
    plugins_dir: PathBuf,
    state_path: PathBuf,
    lock: Mutex<()>,
}

impl TomlRegistry {
    pub fn new(plugins_dir: PathBuf, state_path: PathBuf) -> Self {
        Self {
            plugins_dir,
            state_path,
            lock: Mutex::new(()),
        }
    }

    fn read_state(&self) -> Result<StateFile> {
        match fs::read_to_string(&self.state_path) {
            Ok(raw) => toml::from_str(&raw)
                .with_context(|| format!("parse {}", self.state_path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(StateFile::default()),
            Err(err) => {
                Err(err).with_context(|| format!("read {}", self.state_path.display()))
            }
        }
    }

    fn write_state(&self, state: &StateFile) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(state).context("serialize plugin state")?;
        let tmp = self.state_path.with_extension("toml.tmp");
        fs::write(&tmp, raw).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.state_path)
            .with_context(|| format!("replace {}", self.state_path.display()))?;
        Ok(())
    }

    fn modify_state(&self, apply: impl FnOnce(&mut StateFile)) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("plugin state lock poisoned"))?;
        let mut state = self.read_state()?;
        apply(&mut state);
        self.write_state(&state)
    }

    fn plugin_dirs(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.plugins_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read {}", self.plugins_dir.display()));
            }
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_dir() && path.join(MANIFEST_FILE).is_file())
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    /// The installed directory of `plugin_id`, matched on the manifest id.
    fn installed_dir(&self, plugin_id: &str) -> Result<Option<PathBuf>> {
        Ok(self.plugin_dirs()?.into_iter().find(|dir| {
            PluginManifest::read_from_dir(dir)
                .map(|manifest| manifest.id == plugin_id)
                .unwrap_or_else(|_| dir_name(dir) == plugin_id)
        }))
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

impl PluginRegistry for TomlRegistry {
    fn load_all(&self) -> Result<Vec<std::result::Result<InstalledPlugin, LoadError>>> {
        if !self.plugins_dir.is_dir() {
            tracing::info!(dir = %self.plugins_dir.display(), "no plugins directory");
            return Ok(Vec::new());
        }

        let mut states = self.read_state()?.plugins;
        Ok(self
            .plugin_dirs()?
            .into_iter()
            .map(|dir| {
                let dir_name = dir_name(&dir);
                PluginManifest::read_from_dir(&dir)
                    .map(|manifest| InstalledPlugin {
                        state: states.remove(&manifest.id),
                        manifest,
                        plugin_path: dir.clone(),
                    })
                    .map_err(|err| LoadError {
                        plugin_id: dir_name,
                        message: err.to_string(),
                    })
            })
            .collect())
    }

    fn stored_state(&self, plugin_id: &str) -> Result<Option<StoredState>> {
        Ok(self.read_state()?.plugins.remove(plugin_id))
    }

    fn save(&self, ctx: &PluginContext) -> Result<()> {
        let stored = StoredState::from_context(ctx);
        self.modify_state(|state| {
            state.plugins.insert(ctx.id().to_string(), stored);
        })
    }

    fn remove(&self, plugin_id: &str) -> Result<()> {
        if let Some(dir) = self.installed_dir(plugin_id)? {
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
            tracing::info!(plugin = plugin_id, dir = %dir.display(), "plugin files removed");
        }
        self.modify_state(|state| {
            state.plugins.remove(plugin_id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_plugin(root: &Path, id: &str, body: &str) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).expect("plugin dir");
        fs::write(dir.join(MANIFEST_FILE), body).expect("manifest");
    }

    fn manifest_toml(id: &str) -> String {
        format!(
            "id = \"{id}\"\nname = \"{id}\"\nversion = \"1.0.0\"\nentry = \"plugin.wasm\"\n\
             permissions = [\"network\"]\ntriggers = [\"{id}:\"]\n"
        )
    }

    #[test]
    fn missing_plugins_dir_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = TomlRegistry::new(dir.path().join("plugins"), dir.path().join("state.toml"));
        assert!(registry.load_all().expect("load").is_empty());
    }

    #[test]
    fn bad_manifest_is_reported_without_failing_others() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_plugin(dir.path(), "good", &manifest_toml("good"));
        write_plugin(dir.path(), "broken", "id = \"broken\"\n");

        let registry = TomlRegistry::new(dir.path().to_path_buf(), dir.path().join("state.toml"));
        let loaded = registry.load_all().expect("load");
        assert_eq!(loaded.len(), 2);

        let errors: Vec<&LoadError> = loaded.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].plugin_id, "broken");

        let good = loaded.iter().find_map(|r| r.as_ref().ok()).expect("good plugin");
        assert_eq!(good.manifest.id, "good");
        assert_eq!(good.state, None);
    }

    #[test]
    fn saved_state_is_reloaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_plugin(dir.path(), "net", &manifest_toml("net"));
        let registry = TomlRegistry::new(dir.path().to_path_buf(), dir.path().join("state.toml"));

        let installed = registry
            .load_all()
            .expect("load")
            .remove(0)
            .expect("installed");
        let mut ctx = PluginContext::new(installed.manifest, installed.plugin_path);
        ctx.is_enabled = true;
        ctx.grant(&[Permission::Network]);
        ctx.crash_count = 2;
        ctx.settings
            .insert("endpoint".to_string(), toml::Value::String("https://x.test".to_string()));
        ctx.settings.insert("retries".to_string(), toml::Value::Integer(3));
        registry.save(&ctx).expect("save");

        let reloaded = TomlRegistry::new(dir.path().to_path_buf(), dir.path().join("state.toml"));
        let state = reloaded
            .load_all()
            .expect("load")
            .remove(0)
            .expect("installed")
            .state
            .expect("state");
        assert_eq!(
            state,
            StoredState {
                enabled: true,
                granted: vec![Permission::Network],
                crash_count: 2,
                settings: ctx.settings.clone(),
            }
        );

        reloaded.remove("net").expect("remove");
        assert_eq!(reloaded.stored_state("net").expect("state"), None);
        assert!(!dir.path().join("net").exists());
        assert!(reloaded.load_all().expect("load").is_empty());
    }

    #[test]
    fn remove_matches_the_manifest_id_not_the_directory_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_plugin(dir.path(), "renamed-dir", &manifest_toml("weather"));
        write_plugin(dir.path(), "other", &manifest_toml("other"));
        let registry = TomlRegistry::new(dir.path().to_path_buf(), dir.path().join("state.toml"));

        registry.remove("weather").expect("remove");
        assert!(!dir.path().join("renamed-dir").exists());

        let left: Vec<String> = registry
            .load_all()
            .expect("load")
            .into_iter()
            .filter_map(|r| r.ok().map(|installed| installed.manifest.id))
            .collect();
        assert_eq!(left, vec!["other".to_string()]);

        registry.remove("never-installed").expect("remove unknown");
    }
}
