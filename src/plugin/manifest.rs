use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::plugin::permission::Permission;

pub const MANIFEST_FILE: &str = "plugin.toml";
pub const BUILTIN_ENTRY_PREFIX: &str = "builtin:";

const MAX_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub entry: String,
}

/// Where a plugin's code comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRef {
    /// Native handler compiled into the host.
    Builtin(String),
    /// WASM module, relative to the plugin directory.
    Wasm(PathBuf),
}

impl EntryRef {
    pub fn parse(entry: &str) -> Self {
        match entry.strip_prefix(BUILTIN_ENTRY_PREFIX) {
            Some(name) => Self::Builtin(name.trim().to_string()),
            None => Self::Wasm(PathBuf::from(entry.trim())),
        }
    }
}

impl PluginManifest {
    pub fn entry_ref(&self) -> EntryRef {
        EntryRef::parse(&self.entry)
    }

    pub fn declares(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Read and validate `<root_dir>/plugin.toml`.
    pub fn read_from_dir(root_dir: &Path) -> EngineResult<Self> {
        let manifest_path = root_dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&manifest_path).map_err(|err| {
            EngineError::invalid_manifest(None, vec![format!("{}: {err}", manifest_path.display())])
        })?;

        let manifest = toml::from_str::<PluginManifest>(&raw).map_err(|err| {
            EngineError::invalid_manifest(None, vec![format!("{}: {err}", manifest_path.display())])
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reject manifests with missing or unsafe required fields.
    ///
    /// Returns the non-fatal warnings on success.
    pub fn validate(&self) -> EngineResult<Vec<String>> {
        let mut problems = Vec::new();

        if self.id.trim().is_empty() {
            problems.push("id is required".to_string());
        } else if !is_valid_plugin_id(&self.id) {
            problems.push(format!(
                "id '{}' must be 1-{MAX_ID_LEN} chars of [a-z0-9_-]",
                self.id
            ));
        }
        if self.name.trim().is_empty() {
            problems.push("name is required".to_string());
        }
        if self.version.trim().is_empty() {
            problems.push("version is required".to_string());
        }
        if self.entry.trim().is_empty() {
            problems.push("entry is required".to_string());
        } else if let EntryRef::Wasm(path) = self.entry_ref() {
            let text = path.to_string_lossy();
            if path.is_absolute() || text.starts_with('/') || text.contains("..") {
                problems.push(format!("entry '{text}' must stay inside the plugin directory"));
            }
        }
        if self.triggers.iter().any(|trigger| trigger.trim().is_empty()) {
            problems.push("triggers must not be blank".to_string());
        }

        if !problems.is_empty() {
            return Err(EngineError::invalid_manifest(Some(&self.id), problems));
        }

        Ok(self.warnings())
    }

    fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.triggers.is_empty() {
            warnings.push("no triggers declared; plugin can never be dispatched".to_string());
        }
        for trigger in &self.triggers {
            if !trigger.ends_with(':') {
                warnings.push(format!("trigger '{trigger}' should end with ':'"));
            }
        }
        if self.declares(Permission::Shell) {
            warnings.push("declares the shell permission".to_string());
        }
        if !is_semver_like(&self.version) {
            warnings.push(format!("version '{}' is not x.y.z", self.version));
        }
        warnings
    }
}

fn is_valid_plugin_id(id: &str) -> bool {
    id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

fn is_semver_like(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}
