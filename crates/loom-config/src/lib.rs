//! # loom-config
//!
//! Configuration management for Loom.
//!
//! Loads configuration from:
//! 1. `~/.loom/config.toml` (global)
//! 2. `.loom/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Default controller address. Daemons and `loomctl` fall back to this.
pub const DEFAULT_CONTROLLER_HOST: &str = "127.0.0.1";
pub const DEFAULT_CONTROLLER_PORT: u16 = 1221;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub engine: EngineConfig,
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.loom/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load project config (.loom/config.toml) - overrides global
        let project_path = Self::project_config_path();
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let contents = std::fs::read_to_string(project_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Load a single config file, without the global/project cascade.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.loom/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".loom/config.toml"))
    }

    /// Project config path: .loom/config.toml
    pub fn project_config_path() -> &'static Path {
        Path::new(".loom/config.toml")
    }

    /// Merge another config (project overrides). Fields left at their
    /// default in `other` keep the value already loaded.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();

        if other.controller.host != defaults.controller.host {
            self.controller.host = other.controller.host;
        }
        if other.controller.port != defaults.controller.port {
            self.controller.port = other.controller.port;
        }
        if other.controller.max_filters != defaults.controller.max_filters {
            self.controller.max_filters = other.controller.max_filters;
        }

        if other.engine.max_slots != defaults.engine.max_slots {
            self.engine.max_slots = other.engine.max_slots;
        }
        if other.engine.max_back_edges != defaults.engine.max_back_edges {
            self.engine.max_back_edges = other.engine.max_back_edges;
        }
        if other.engine.max_call_sites != defaults.engine.max_call_sites {
            self.engine.max_call_sites = other.engine.max_call_sites;
        }
        if other.engine.max_functions != defaults.engine.max_functions {
            self.engine.max_functions = other.engine.max_functions;
        }
        if other.engine.revert_switches_on_remove != defaults.engine.revert_switches_on_remove {
            self.engine.revert_switches_on_remove = other.engine.revert_switches_on_remove;
        }

        if other.daemon.reconnect_interval_ms != defaults.daemon.reconnect_interval_ms {
            self.daemon.reconnect_interval_ms = other.daemon.reconnect_interval_ms;
        }
        if other.daemon.max_reconnect_attempts != defaults.daemon.max_reconnect_attempts {
            self.daemon.max_reconnect_attempts = other.daemon.max_reconnect_attempts;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("LOOM_CONTROLLER_HOST") {
            self.controller.host = host;
        }
        if let Ok(port) = std::env::var("LOOM_CONTROLLER_PORT") {
            if let Ok(p) = port.parse() {
                self.controller.port = p;
            }
        }
        if let Ok(slots) = std::env::var("LOOM_MAX_SLOTS") {
            if let Ok(n) = slots.parse() {
                self.engine.max_slots = n;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Controller endpoint and filter-id space
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
    /// Filter ids handed out by the controller are in `[0, max_filters)`
    pub max_filters: u32,
}

impl ControllerConfig {
    /// `host:port` string suitable for `TcpStream::connect`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_CONTROLLER_HOST.to_string(),
            port: DEFAULT_CONTROLLER_PORT,
            max_filters: 10_000,
        }
    }
}

/// Table capacities of the in-process update engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of instrumented slots (program points carrying operations)
    pub max_slots: u32,
    /// Number of instrumented loop back edges
    pub max_back_edges: u32,
    /// Number of instrumented blocking call sites
    pub max_call_sites: u32,
    /// Number of functions with a patched clone
    pub max_functions: u32,
    /// Flip function switches back when the last filter patching them goes away
    pub revert_switches_on_remove: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_slots: 2_000_000,
            max_back_edges: 65_536,
            max_call_sites: 65_536,
            max_functions: 65_536,
            revert_switches_on_remove: true,
        }
    }
}

/// In-process daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Delay between attempts to (re)connect to the controller
    pub reconnect_interval_ms: u64,
    /// Give up after this many failed attempts in a row (0 = never)
    pub max_reconnect_attempts: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 1000,
            max_reconnect_attempts: 0,
        }
    }
}
