//! Configuration management for the i3pm daemon.
//!
//! Configuration is loaded from TOML files in the following locations (in order):
//! 1. The platform config dir (`$XDG_CONFIG_HOME/i3pm/config.toml`)
//! 2. `~/.config/i3pm/config.toml`
//! 3. `./config.toml` (current directory, for development)

use anyhow::{Context, Result};
use directories::ProjectDirs;
use i3pm_core::{is_valid_workspace, DEFAULT_FALLBACK_WORKSPACE, MAX_WORKSPACE, MIN_WORKSPACE};
use i3pm_platform_sway::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for i3pm.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Window manager connection.
    pub manager: ManagerConfig,
    /// Persisted window state.
    pub state: StateConfig,
    /// Filtering behavior.
    pub filter: FilterConfig,
    /// RPC socket.
    pub rpc: RpcConfig,
    /// General behavior.
    pub behavior: BehaviorConfig,
    /// Application registry (JSON array of application descriptors).
    #[serde(default)]
    pub registry_path: Option<PathBuf>,
    /// Directory of `<project>.json` definitions. When set, unknown project
    /// names are rejected.
    #[serde(default)]
    pub projects_dir: Option<PathBuf>,
}

/// Window manager connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Socket path. Falls back to `SWAYSOCK`, then `I3SOCK`.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Connection attempts at startup before giving up.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Delay before the first retry in milliseconds. Doubles on each attempt.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the retry delay in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            connect_attempts: default_connect_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl ManagerConfig {
    /// Retry policy for the startup connection.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Persisted state settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// State file path. Defaults to the platform data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Maximum number of window records kept.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_records: default_max_records(),
        }
    }
}

/// How remembered workspaces are checked before restoring.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceValidation {
    /// The workspace must exist in a fresh workspace query.
    ///
    /// i3 destroys a workspace once its last window leaves, so a window that
    /// was alone on an unassigned workspace falls back on restore. Use
    /// `range`, or assign the workspace to an output, to keep it.
    #[default]
    Live,
    /// Any number in 1..=70 is accepted; the manager creates missing workspaces.
    Range,
}

/// Filtering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Workspace used when a remembered workspace is unusable.
    #[serde(default = "default_fallback_workspace")]
    pub fallback_workspace: i32,

    /// How remembered workspaces are validated.
    #[serde(default)]
    pub workspace_validation: WorkspaceValidation,

    /// Prefix of the mark placed on windows this daemon hides. Each hidden
    /// window gets `<prefix>:<window id>`.
    #[serde(default = "default_hidden_mark")]
    pub hidden_mark: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            fallback_workspace: default_fallback_workspace(),
            workspace_validation: WorkspaceValidation::default(),
            hidden_mark: default_hidden_mark(),
        }
    }
}

/// RPC socket settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Socket path. Defaults to `$XDG_RUNTIME_DIR/i3pm/daemon.sock`.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

/// Behavior-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Tick payload prefix that requests a project switch.
    #[serde(default = "default_switch_tick_prefix")]
    pub switch_tick_prefix: String,

    /// Move new windows to their registry workspace.
    #[serde(default = "default_true")]
    pub apply_preferred_workspace: bool,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            switch_tick_prefix: default_switch_tick_prefix(),
            apply_preferred_workspace: true,
        }
    }
}

// Default value functions for serde
fn default_connect_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    250
}

fn default_max_backoff() -> u64 {
    5_000
}

fn default_max_records() -> usize {
    1000
}

fn default_fallback_workspace() -> i32 {
    DEFAULT_FALLBACK_WORKSPACE
}

fn default_hidden_mark() -> String {
    "_i3pm_hidden".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_switch_tick_prefix() -> String {
    "i3pm:switch:".to_string()
}

fn default_true() -> bool {
    true
}

/// A config value that was adjusted during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub field: &'static str,
    pub message: String,
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load configuration from standard locations.
    ///
    /// Returns default config if no file is found.
    pub fn load() -> Result<Self> {
        let paths = config_paths();

        for path in &paths {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::load_from_path(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Clamp out-of-range values, returning a warning for each change.
    pub fn validate(&mut self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if !is_valid_workspace(self.filter.fallback_workspace) {
            warnings.push(ConfigWarning {
                field: "filter.fallback_workspace",
                message: format!(
                    "{} is outside {}..={}, using {}",
                    self.filter.fallback_workspace,
                    MIN_WORKSPACE,
                    MAX_WORKSPACE,
                    DEFAULT_FALLBACK_WORKSPACE
                ),
            });
            self.filter.fallback_workspace = DEFAULT_FALLBACK_WORKSPACE;
        }

        let mark = self.filter.hidden_mark.trim();
        if mark.is_empty() || mark.contains('"') {
            warnings.push(ConfigWarning {
                field: "filter.hidden_mark",
                message: format!("{:?} is not a usable mark, using default", self.filter.hidden_mark),
            });
            self.filter.hidden_mark = default_hidden_mark();
        } else if mark.len() != self.filter.hidden_mark.len() {
            self.filter.hidden_mark = mark.to_string();
        }

        if self.state.max_records == 0 {
            warnings.push(ConfigWarning {
                field: "state.max_records",
                message: format!("must be positive, using {}", default_max_records()),
            });
            self.state.max_records = default_max_records();
        }

        if self.manager.connect_attempts == 0 {
            warnings.push(ConfigWarning {
                field: "manager.connect_attempts",
                message: "must be at least 1, using 1".to_string(),
            });
            self.manager.connect_attempts = 1;
        }

        if self.manager.max_backoff_ms < self.manager.initial_backoff_ms {
            warnings.push(ConfigWarning {
                field: "manager.max_backoff_ms",
                message: format!(
                    "{} is below initial_backoff_ms, using {}",
                    self.manager.max_backoff_ms, self.manager.initial_backoff_ms
                ),
            });
            self.manager.max_backoff_ms = self.manager.initial_backoff_ms;
        }

        if self.behavior.switch_tick_prefix.is_empty() {
            warnings.push(ConfigWarning {
                field: "behavior.switch_tick_prefix",
                message: format!("must not be empty, using {:?}", default_switch_tick_prefix()),
            });
            self.behavior.switch_tick_prefix = default_switch_tick_prefix();
        }

        let level = self.behavior.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            warnings.push(ConfigWarning {
                field: "behavior.log_level",
                message: format!("unknown level {:?}, using info", self.behavior.log_level),
            });
            self.behavior.log_level = default_log_level();
        }

        warnings
    }

    /// State file path, from config or the platform data dir.
    pub fn state_path(&self) -> PathBuf {
        self.state.path.clone().unwrap_or_else(default_state_path)
    }

    /// RPC socket path, from config or the runtime dir.
    pub fn rpc_socket_path(&self) -> PathBuf {
        self.rpc
            .socket_path
            .clone()
            .unwrap_or_else(i3pm_ipc::default_socket_path)
    }
}

/// Get all possible config file paths in priority order.
pub fn config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. Platform standard: $XDG_CONFIG_HOME/i3pm/config.toml
    if let Some(proj_dirs) = ProjectDirs::from("", "", "i3pm") {
        paths.push(proj_dirs.config_dir().join("config.toml"));
    }

    // 2. ~/.config/i3pm/config.toml
    if let Some(home) = dirs_home() {
        let path = home.join(".config").join("i3pm").join("config.toml");
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    // 3. Current directory: ./config.toml
    paths.push(PathBuf::from("config.toml"));

    paths
}

/// Default state file location.
pub fn default_state_path() -> PathBuf {
    ProjectDirs::from("", "", "i3pm")
        .map(|dirs| dirs.data_dir().join("window-workspace-map.json"))
        .unwrap_or_else(|| PathBuf::from("window-workspace-map.json"))
}

/// Get the user's home directory.
fn dirs_home() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}
