//! Daemon configuration.
//!
//! Values come from (lowest to highest precedence): built-in defaults, the
//! YAML config file, `GEOPM_SERVICE_*` environment variables, CLI flags.

use crate::service_paths::{DEFAULT_CONFIG_ROOT, DEFAULT_RUN_ROOT, DEFAULT_SOCKET_PATH};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file consulted when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/geopm-service/geopmd.yaml";

/// Overrides the run root.
pub const RUN_PATH_ENV: &str = "GEOPM_SERVICE_RUN_PATH";
/// Overrides the access-list root.
pub const CONFIG_PATH_ENV: &str = "GEOPM_SERVICE_CONFIG_PATH";
/// Overrides the RPC socket path.
pub const SOCKET_ENV: &str = "GEOPM_SERVICE_SOCKET";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Runtime state: sessions, control lock, save directory.
    #[serde(default = "default_run_root")]
    pub run_root: PathBuf,
    /// Access lists, one directory per group.
    #[serde(default = "default_config_root")]
    pub config_root: PathBuf,
    /// Unix socket the RPC server listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Client liveness poll period. Default: 1000 (1 Hz)
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
    /// Key the write lock by the client's session id instead of its pid so
    /// that every process of a shell pipeline shares one write session.
    #[serde(default)]
    pub share_write_lock_by_sid: bool,
    /// Keep `session-<pid>.json-<uuid>-REMOVE` files after close for auditing.
    #[serde(default)]
    pub audit_removed_sessions: bool,
    /// YAML platform catalog served by the built-in simulation backend.
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
}

fn default_run_root() -> PathBuf {
    PathBuf::from(DEFAULT_RUN_ROOT)
}

fn default_config_root() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_ROOT)
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_watch_interval_ms() -> u64 {
    1000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            run_root: default_run_root(),
            config_root: default_config_root(),
            socket_path: default_socket_path(),
            watch_interval_ms: default_watch_interval_ms(),
            share_write_lock_by_sid: false,
            audit_removed_sessions: false,
            catalog_path: None,
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, else the default config file when it exists,
    /// else the built-in defaults. Environment overrides are applied last.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = env_path(RUN_PATH_ENV) {
            self.run_root = path;
        }
        if let Some(path) = env_path(CONFIG_PATH_ENV) {
            self.config_root = path;
        }
        if let Some(path) = env_path(SOCKET_ENV) {
            self.socket_path = path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("run_root", &self.run_root),
            ("config_root", &self.config_root),
            ("socket_path", &self.socket_path),
        ] {
            if !path.is_absolute() {
                anyhow::bail!("{} must be an absolute path: {}", name, path.display());
            }
        }
        if self.run_root == self.config_root {
            anyhow::bail!("run_root and config_root must differ");
        }
        if self.watch_interval_ms == 0 {
            anyhow::bail!("watch_interval_ms must be greater than zero");
        }
        Ok(())
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod config_tests;
