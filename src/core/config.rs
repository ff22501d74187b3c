//! Configuration management for Runbookd.
//!
//! Handles layered loading from defaults, an optional TOML file, and
//! environment variable overrides. Every resolved option is tracked as a
//! config item with its source so execution records can snapshot the
//! configuration that was in effect.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default script timeout in seconds (10 minutes).
const DEFAULT_SCRIPT_TIMEOUT_SECONDS: u64 = 600;

/// Default per-stream output cap in bytes (10 MiB).
const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Default maximum depth of nested runbook invocations.
const DEFAULT_MAX_RECURSION_DEPTH: usize = 50;

/// Application configuration.
///
/// Constructed once at startup and effectively immutable afterwards; the
/// service receives it by value through its constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunbookConfig {
    /// Directory containing runbook files
    pub runbooks_dir: PathBuf,

    /// Shell interpreter used to run scripts
    pub shell_path: PathBuf,

    /// Wall-clock limit for one script execution
    pub script_timeout_seconds: u64,

    /// Per-stream cap on captured stdout/stderr
    pub max_output_bytes: usize,

    /// Maximum depth of nested runbook invocations
    pub max_recursion_depth: usize,

    /// Scheme used to build the API base URL exported to scripts
    pub api_protocol: String,

    /// Host used to build the API base URL exported to scripts
    pub api_host: String,

    /// Port used to build the API base URL exported to scripts
    pub api_port: u16,

    /// Root for execution workspaces; the OS temp root when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Resolved config items with their sources
    #[serde(skip)]
    config_items: Vec<ConfigItem>,
}

/// One resolved configuration value and where it came from.
///
/// None of the recognized options holds a secret, so values are recorded
/// verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigItem {
    /// Option name
    pub name: String,
    /// Resolved value
    pub value: String,
    /// Source of the value: "default", "file", or "environment"
    pub source: String,
}

impl ConfigItem {
    /// Create a config item.
    pub fn new(name: impl Into<String>, value: impl Into<String>, source: &str) -> Self {
        Self { name: name.into(), value: value.into(), source: source.to_string() }
    }
}

impl Default for RunbookConfig {
    fn default() -> Self {
        Self {
            runbooks_dir: PathBuf::from("./runbooks"),
            shell_path: PathBuf::from("/bin/zsh"),
            script_timeout_seconds: DEFAULT_SCRIPT_TIMEOUT_SECONDS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            api_protocol: "http".to_string(),
            api_host: "localhost".to_string(),
            api_port: 8083,
            workspace_root: None,
            config_items: Vec::new(),
        }
    }
}

impl RunbookConfig {
    /// Load configuration with hierarchical merging.
    ///
    /// Loading order (later overrides earlier):
    /// 1. Defaults
    /// 2. `runbookd.toml` in the current directory, if present
    /// 3. Environment variables (highest priority)
    pub fn load() -> anyhow::Result<Self> {
        let file = PathBuf::from("runbookd.toml");
        let mut config = if file.exists() {
            let loaded = Self::load_from_file(&file)?;
            tracing::debug!(path = %file.display(), "Loaded config file");
            loaded
        } else {
            Self::default()
        };
        let from_file = file.exists();

        config.apply_env_overrides();
        config.clamp_limits();
        config.track_items(from_file);
        Ok(config)
    }

    /// Load configuration from a specific TOML file, without env overrides.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("RUNBOOKS_DIR") {
            self.runbooks_dir = PathBuf::from(dir);
        }
        if let Ok(shell) = std::env::var("RUNBOOK_SHELL") {
            self.shell_path = PathBuf::from(shell);
        }
        if let Ok(timeout) = std::env::var("SCRIPT_TIMEOUT_SECONDS") {
            match timeout.parse() {
                Ok(v) => self.script_timeout_seconds = v,
                Err(_) => {
                    tracing::warn!(value = %timeout, "Ignoring unparseable SCRIPT_TIMEOUT_SECONDS");
                }
            }
        }
        if let Ok(max) = std::env::var("MAX_OUTPUT_SIZE_BYTES") {
            match max.parse() {
                Ok(v) => self.max_output_bytes = v,
                Err(_) => {
                    tracing::warn!(value = %max, "Ignoring unparseable MAX_OUTPUT_SIZE_BYTES");
                }
            }
        }
        if let Ok(depth) = std::env::var("MAX_RECURSION_DEPTH") {
            match depth.parse() {
                Ok(v) => self.max_recursion_depth = v,
                Err(_) => {
                    tracing::warn!(value = %depth, "Ignoring unparseable MAX_RECURSION_DEPTH");
                }
            }
        }
        if let Ok(proto) = std::env::var("API_PROTOCOL") {
            self.api_protocol = proto;
        }
        if let Ok(host) = std::env::var("API_HOST") {
            self.api_host = host;
        }
        if let Ok(port) = std::env::var("API_PORT") {
            match port.parse() {
                Ok(v) => self.api_port = v,
                Err(_) => tracing::warn!(value = %port, "Ignoring unparseable API_PORT"),
            }
        }
        if let Ok(root) = std::env::var("RUNBOOK_WORKSPACE_ROOT") {
            self.workspace_root = Some(PathBuf::from(root));
        }
    }

    /// Reset non-positive resource limits to their defaults.
    fn clamp_limits(&mut self) {
        if self.script_timeout_seconds == 0 {
            tracing::warn!(
                default = DEFAULT_SCRIPT_TIMEOUT_SECONDS,
                "Invalid script_timeout_seconds, using default"
            );
            self.script_timeout_seconds = DEFAULT_SCRIPT_TIMEOUT_SECONDS;
        }
        if self.max_output_bytes == 0 {
            tracing::warn!(
                default = DEFAULT_MAX_OUTPUT_BYTES,
                "Invalid max_output_bytes, using default"
            );
            self.max_output_bytes = DEFAULT_MAX_OUTPUT_BYTES;
        }
        if self.max_recursion_depth == 0 {
            tracing::warn!(
                default = DEFAULT_MAX_RECURSION_DEPTH,
                "Invalid max_recursion_depth, using default"
            );
            self.max_recursion_depth = DEFAULT_MAX_RECURSION_DEPTH;
        }
    }

    /// Record every resolved option with its source.
    fn track_items(&mut self, from_file: bool) {
        let defaults = Self::default();
        let file_source = if from_file { "file" } else { "default" };
        let mut items = Vec::new();

        let mut push = |name: &str, value: String, env_key: &str, default_value: String| {
            let source = if std::env::var(env_key).is_ok() {
                "environment"
            } else if value == default_value {
                "default"
            } else {
                file_source
            };
            items.push(ConfigItem::new(name, value, source));
        };

        push(
            "runbooks_dir",
            self.runbooks_dir.display().to_string(),
            "RUNBOOKS_DIR",
            defaults.runbooks_dir.display().to_string(),
        );
        push(
            "shell_path",
            self.shell_path.display().to_string(),
            "RUNBOOK_SHELL",
            defaults.shell_path.display().to_string(),
        );
        push(
            "script_timeout_seconds",
            self.script_timeout_seconds.to_string(),
            "SCRIPT_TIMEOUT_SECONDS",
            defaults.script_timeout_seconds.to_string(),
        );
        push(
            "max_output_bytes",
            self.max_output_bytes.to_string(),
            "MAX_OUTPUT_SIZE_BYTES",
            defaults.max_output_bytes.to_string(),
        );
        push(
            "max_recursion_depth",
            self.max_recursion_depth.to_string(),
            "MAX_RECURSION_DEPTH",
            defaults.max_recursion_depth.to_string(),
        );
        push(
            "api_protocol",
            self.api_protocol.clone(),
            "API_PROTOCOL",
            defaults.api_protocol.clone(),
        );
        push("api_host", self.api_host.clone(), "API_HOST", defaults.api_host.clone());
        push(
            "api_port",
            self.api_port.to_string(),
            "API_PORT",
            defaults.api_port.to_string(),
        );
        push(
            "workspace_root",
            self.workspace_root
                .as_ref()
                .map_or_else(|| "system temp".to_string(), |p| p.display().to_string()),
            "RUNBOOK_WORKSPACE_ROOT",
            "system temp".to_string(),
        );

        self.config_items = items;
    }

    /// The resolved config items snapshot.
    pub fn config_items(&self) -> &[ConfigItem] {
        &self.config_items
    }

    /// The API base URL exported to scripts as `RUNBOOK_URL`.
    pub fn api_base_url(&self) -> String {
        format!("{}://{}:{}", self.api_protocol, self.api_host, self.api_port)
    }

    /// Builder-style override for the runbooks directory.
    #[must_use]
    pub fn with_runbooks_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runbooks_dir = dir.into();
        self
    }

    /// Builder-style override for the shell interpreter.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell_path = shell.into();
        self
    }

    /// Builder-style override for the script timeout.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.script_timeout_seconds = seconds;
        self
    }

    /// Builder-style override for the output cap.
    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Builder-style override for the recursion depth limit.
    #[must_use]
    pub fn with_max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    /// Builder-style override for the workspace root.
    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }
}
