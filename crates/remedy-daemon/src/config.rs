//! Daemon configuration file.
//!
//! A single JSON document holding the database path, the workflow file
//! to dispatch, the routing entries, and the engine tunables. Unknown
//! fields are rejected so a typo'd key fails loudly instead of being
//! silently ignored. [`DaemonConfig::apply`] performs the hot reload
//! against a running orchestrator.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use remedy_core::config::{EngineConfig, EngineConfigBuilder, EngineConfigError};
use remedy_core::orchestrator::Orchestrator;
use remedy_core::routing::ServiceMapping;

/// Upper bound on the config file size.
const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

/// Errors loading or applying the daemon config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file exceeds the size bound.
    #[error("config {path} is {len} bytes, exceeding the {MAX_CONFIG_BYTES} byte bound")]
    TooLarge {
        /// Path that failed.
        path: PathBuf,
        /// Actual file size.
        len: u64,
    },

    /// The file is not valid JSON or violates the schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The engine tunables are invalid.
    #[error(transparent)]
    Engine(#[from] EngineConfigError),
}

fn default_workflow_file() -> String {
    "remediate.yml".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("remedy.db")
}

/// The daemon's on-disk configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Workflow file dispatched in the target repositories.
    #[serde(default = "default_workflow_file")]
    pub workflow_file: String,
    /// Service to repository routing entries.
    #[serde(default)]
    pub routes: Vec<ServiceMapping>,
    /// Engine tunables; every field optional, defaults applied at build.
    #[serde(default)]
    pub engine: EngineConfigBuilder,
}

impl DaemonConfig {
    /// Loads and parses the config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for I/O failures, an oversized file, or a
    /// document that is malformed or carries unknown fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let metadata = std::fs::metadata(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if metadata.len() > MAX_CONFIG_BYTES {
            return Err(ConfigError::TooLarge {
                path: path.to_path_buf(),
                len: metadata.len(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if config.routes.is_empty() {
            warn!(path = %path.display(), "config has no routing entries; every incident will be unroutable");
        }
        Ok(config)
    }

    /// Builds the validated engine config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Engine`] for invalid tunables.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        Ok(self.engine.clone().build()?)
    }

    /// The routing entries.
    #[must_use]
    pub fn mappings(&self) -> Vec<ServiceMapping> {
        self.routes.clone()
    }

    /// Hot-reloads this config into a running orchestrator: validates
    /// first, then swaps the engine config and the routing snapshot.
    /// In-flight work is untouched; the new limits apply to subsequent
    /// admissions.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Engine`] for invalid tunables; nothing is
    /// swapped on error.
    pub fn apply(&self, orchestrator: &Orchestrator) -> Result<(), ConfigError> {
        let engine = self.engine_config()?;
        orchestrator.reload_config(engine);
        orchestrator.reload_routes(self.mappings());
        info!(routes = self.routes.len(), "daemon config applied");
        Ok(())
    }
}
