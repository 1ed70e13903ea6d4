use anyhow::{Context as _, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    /// Failed executions after which a plugin is quarantined.
    pub crash_threshold: u32,
    pub reset_crashes_on_enable: bool,
    /// WASM linear memory cap in 64 KiB pages.
    pub max_memory_pages: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            crash_threshold: 3,
            reset_crashes_on_enable: false,
            max_memory_pages: 256,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn crash_threshold(&self) -> u32 {
        self.crash_threshold.max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Executions kept per plugin.
    pub history_capacity: usize,
    pub slow_threshold_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            slow_threshold_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { max_results: 50 }
    }
}

/// Bundled plugins loaded when the config does not list its own.
pub const BUNDLED_PLUGINS: [&str; 2] = ["calculator", "clipboard"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub dir: Option<String>,
    pub builtin: Vec<String>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            builtin: BUNDLED_PLUGINS.iter().map(|name| name.to_string()).collect(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            monitor: MonitorConfig::default(),
            search: SearchConfig::default(),
            plugins: PluginsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration with layering: defaults → user config.
    pub fn load() -> Result<Self> {
        let user_path = directories::ProjectDirs::from("", "", "launchbox")
            .map(|dirs| dirs.config_dir().join("config.toml"));
        Self::load_layered(user_path.as_deref())
    }

    pub fn load_layered(user_path: Option<&Path>) -> Result<Self> {
        let defaults = include_str!("../../config/default.toml");
        let mut config: AppConfig = toml::from_str(defaults)?;

        if let Some(path) = user_path.filter(|path| path.exists()) {
            let user_str = fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            let user: UserConfig = toml::from_str(&user_str)
                .with_context(|| format!("parse config {}", path.display()))?;
            config.apply(user);
        }

        if let Some(dir) = config.plugins.dir.as_mut() {
            if dir.starts_with('~') {
                let home = dirs_home().ok_or_else(|| anyhow!("cannot determine home directory"))?;
                *dir = dir.replacen('~', &home.to_string_lossy(), 1);
            }
        }

        Ok(config)
    }

    pub fn plugins_dir(&self) -> PathBuf {
        if let Some(dir) = self.plugins.dir.as_ref() {
            return PathBuf::from(dir);
        }

        if let Some(project_dirs) = directories::ProjectDirs::from("", "", "launchbox") {
            return project_dirs.config_dir().join("plugins");
        }

        PathBuf::from(".launchbox-plugins")
    }

    pub fn state_path(&self) -> PathBuf {
        self.plugins_dir().join("state.toml")
    }

    fn apply(&mut self, user: UserConfig) {
        if let Some(sandbox) = user.sandbox {
            self.sandbox = sandbox;
        }
        if let Some(monitor) = user.monitor {
            self.monitor = monitor;
        }
        if let Some(search) = user.search {
            self.search = search;
        }
        if let Some(plugins) = user.plugins {
            self.plugins = plugins;
        }
    }
}

/// User overrides replace whole sections; missing sections keep the defaults.
#[derive(Debug, Deserialize)]
struct UserConfig {
    sandbox: Option<SandboxConfig>,
    monitor: Option<MonitorConfig>,
    search: Option<SearchConfig>,
    plugins: Option<PluginsConfig>,
}

fn dirs_home() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}
