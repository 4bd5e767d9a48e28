//! Engine configuration file.
//!
//! ```json
//! {
//!   "database_url": "sqlite:///var/lib/ect/ect.db",
//!   "stale_lock_after_secs": 14400,
//!   "cache_graphs": true,
//!   "log_level": "info"
//! }
//! ```
//!
//! Every field is optional; missing fields take their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading an [`EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file '{path}'")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config file '{path}'")]
  Parse {
    path: String,
    #[source]
    source: serde_json::Error,
  },
}

fn default_stale_lock_after_secs() -> u64 {
  4 * 60 * 60
}

fn default_cache_graphs() -> bool {
  true
}

fn default_log_level() -> String {
  "info".to_string()
}

/// Runtime configuration for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
  /// Database connection string. `None` uses `ect.db` in the data directory.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub database_url: Option<String>,

  /// Age after which a lock is reported as stale in lock listings.
  /// Stale locks are never cleared automatically.
  #[serde(default = "default_stale_lock_after_secs")]
  pub stale_lock_after_secs: u64,

  /// Keep validated status graphs in memory between requests.
  #[serde(default = "default_cache_graphs")]
  pub cache_graphs: bool,

  /// Default tracing filter when `RUST_LOG` is not set.
  #[serde(default = "default_log_level")]
  pub log_level: String,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      database_url: None,
      stale_lock_after_secs: default_stale_lock_after_secs(),
      cache_graphs: default_cache_graphs(),
      log_level: default_log_level(),
    }
  }
}

impl EngineConfig {
  /// Load a config from a JSON file.
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.display().to_string(),
      source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.display().to_string(),
      source,
    })
  }

  /// Load a config from a JSON file if it exists, defaults otherwise.
  pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
    if path.exists() {
      Self::from_file(path)
    } else {
      Ok(Self::default())
    }
  }

  pub fn stale_lock_after(&self) -> Duration {
    Duration::from_secs(self.stale_lock_after_secs)
  }
}
