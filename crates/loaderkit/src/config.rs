//! Configuration for hosts embedding loaderkit.
//!
//! Lookup order: explicit path > `$LOADERKIT_CONFIG_DIR/config.toml` >
//! `$XDG_CONFIG_HOME/loaderkit/config.toml` > `~/.config/loaderkit/config.toml`
//! (via `dirs`) > defaults.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::loader::Throttle;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to parse config {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("Failed to serialize config: {0}")]
  Serialize(#[from] toml::ser::Error),
}

// ============================================================================
// Loader Configuration
// ============================================================================

/// Defaults applied to loaders created by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
  /// Minimum spacing between the end of one load and the start of the next,
  /// in milliseconds (0 = no throttle)
  /// Default: 0
  pub update_throttle_ms: u64,
}

impl Default for LoaderConfig {
  fn default() -> Self {
    Self { update_throttle_ms: 0 }
  }
}

impl LoaderConfig {
  pub fn throttle(&self) -> Throttle {
    Throttle::new(Duration::from_millis(self.update_throttle_ms))
  }
}

// ============================================================================
// Executor Configuration
// ============================================================================

/// Background pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
  /// Upper bound on threads running background loads
  /// Default: 8
  #[serde(default = "default_max_blocking_threads")]
  pub max_blocking_threads: usize,

  /// Name given to pool threads
  /// Default: "loaderkit-worker"
  #[serde(default = "default_thread_name")]
  pub thread_name: String,
}

fn default_max_blocking_threads() -> usize {
  8
}
fn default_thread_name() -> String {
  "loaderkit-worker".to_string()
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      max_blocking_threads: default_max_blocking_threads(),
      thread_name: default_thread_name(),
    }
  }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  /// Default: "info"
  #[serde(default = "default_log_level")]
  pub level: String,

  /// Also write logs to this file
  #[serde(skip_serializing_if = "Option::is_none")]
  pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: None,
    }
  }
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  #[serde(default)]
  pub loader: LoaderConfig,

  #[serde(default)]
  pub executor: ExecutorConfig,

  #[serde(default)]
  pub logging: LoggingConfig,
}

impl Config {
  /// Load a config file. Missing sections and keys take their defaults.
  pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Load the user config, falling back to defaults if there is none or it
  /// cannot be parsed.
  pub fn load() -> Self {
    if let Some(path) = Self::user_config_path()
      && path.exists()
    {
      match Self::load_from_path(&path) {
        Ok(config) => return config,
        Err(error) => warn!(%error, "Ignoring user config"),
      }
    }
    Self::default()
  }

  /// Load `explicit` if given (errors are returned), otherwise the user
  /// config.
  pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
    match explicit {
      Some(path) => Self::load_from_path(path),
      None => Ok(Self::load()),
    }
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("LOADERKIT_CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("loaderkit").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("loaderkit").join("config.toml"))
  }

  pub fn to_toml(&self) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(self)?)
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    let defaults = Self::default();
    format!(
      r#"# loaderkit configuration
# Place in ~/.config/loaderkit/config.toml or point --config at it.

# ============================================================================
# Loaders
# ============================================================================

[loader]
# Minimum milliseconds between the end of one load and the start of the next.
# 0 disables throttling.
update_throttle_ms = {throttle}

# ============================================================================
# Background executor
# ============================================================================

[executor]
# Upper bound on threads running background loads
max_blocking_threads = {threads}

# Name given to pool threads
thread_name = "{thread_name}"

# ============================================================================
# Logging
# ============================================================================

[logging]
# off, error, warn, info, debug, trace (RUST_LOG overrides)
level = "{level}"

# Also write logs to a file (uncomment to use):
# file = "/tmp/loaderkit.log"
"#,
      throttle = defaults.loader.update_throttle_ms,
      threads = defaults.executor.max_blocking_threads,
      thread_name = defaults.executor.thread_name,
      level = defaults.logging.level,
    )
  }
}
