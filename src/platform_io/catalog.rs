//! In-memory platform driven by a YAML catalog.
//!
//! Serves the daemon's simulation mode and the test suite. Control writes
//! update an in-memory table, snapshots are JSON files written through
//! SecureFiles, and batch servers are bookkeeping entries with synthetic
//! pids above the kernel's pid range.

use super::{BatchRequest, ControlInfo, Domain, PlatformIo, SignalInfo};
use crate::daemon_log::daemon_log;
use crate::secure_files::{secure_make_file, secure_read_file};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Snapshot file written into the save directory.
pub const SAVED_CONTROLS_FILE: &str = "controls.json";

/// First synthetic batch server pid; larger than any `pid_max`.
pub const FIRST_BATCH_PID: u32 = 0x4000_0000;

const BUILTIN_CATALOG: &str = include_str!("default_catalog.yaml");

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogSignal {
    pub name: String,
    pub description: String,
    pub domain: Domain,
    #[serde(default = "default_aggregation")]
    pub aggregation: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_behavior")]
    pub behavior: String,
    #[serde(default)]
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogControl {
    pub name: String,
    pub description: String,
    pub domain: Domain,
    #[serde(default)]
    pub value: f64,
}

fn default_aggregation() -> String {
    "average".to_string()
}

fn default_format() -> String {
    "double".to_string()
}

fn default_behavior() -> String {
    "variable".to_string()
}

/// Platform description: domain counts plus signal and control tables.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Catalog {
    /// Number of instances per domain; absent domains have one.
    #[serde(default)]
    pub topology: BTreeMap<Domain, u32>,
    #[serde(default)]
    pub signals: Vec<CatalogSignal>,
    #[serde(default)]
    pub controls: Vec<CatalogControl>,
}

impl Catalog {
    pub fn builtin() -> Result<Self> {
        serde_yaml::from_str(BUILTIN_CATALOG).context("Failed to parse built-in catalog")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse catalog as YAML: {}", path.display()))
    }

    fn domain_count(&self, domain: Domain) -> u32 {
        self.topology.get(&domain).copied().unwrap_or(1)
    }
}

/// One control setting inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SavedControl {
    name: String,
    domain: Domain,
    domain_idx: u32,
    value: f64,
}

#[derive(Default)]
struct CatalogState {
    /// Written control values keyed by (name, domain, index).
    settings: HashMap<(String, Domain, u32), f64>,
    /// Running batch servers: server pid to client pid.
    batch_servers: BTreeMap<u32, u32>,
    next_batch_pid: u32,
}

pub struct CatalogIo {
    catalog: Catalog,
    state: Mutex<CatalogState>,
}

impl CatalogIo {
    pub fn new(catalog: Catalog) -> Self {
        Self::with_first_batch_pid(catalog, FIRST_BATCH_PID)
    }

    pub fn with_first_batch_pid(catalog: Catalog, first_batch_pid: u32) -> Self {
        Self {
            catalog,
            state: Mutex::new(CatalogState {
                next_batch_pid: first_batch_pid,
                ..CatalogState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn signal(&self, name: &str) -> Option<&CatalogSignal> {
        self.catalog.signals.iter().find(|s| s.name == name)
    }

    fn control(&self, name: &str) -> Option<&CatalogControl> {
        self.catalog.controls.iter().find(|c| c.name == name)
    }

    fn check_index(&self, domain: Domain, domain_idx: u32) -> Result<()> {
        let count = self.catalog.domain_count(domain);
        if domain_idx >= count {
            bail!(
                "Domain index {} out of range for {} (count {})",
                domain_idx,
                domain,
                count
            );
        }
        Ok(())
    }

    fn control_value(
        &self,
        state: &CatalogState,
        control: &CatalogControl,
        domain: Domain,
        idx: u32,
    ) -> f64 {
        state
            .settings
            .get(&(control.name.clone(), domain, idx))
            .copied()
            .unwrap_or(control.value)
    }
}

impl PlatformIo for CatalogIo {
    fn signal_names(&self) -> Vec<String> {
        self.catalog.signals.iter().map(|s| s.name.clone()).collect()
    }

    fn control_names(&self) -> Vec<String> {
        self.catalog.controls.iter().map(|c| c.name.clone()).collect()
    }

    fn signal_info(&self, names: &[String]) -> Result<Vec<SignalInfo>> {
        names
            .iter()
            .map(|name| {
                let signal = self
                    .signal(name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown signal name: {}", name))?;
                Ok(SignalInfo {
                    name: signal.name.clone(),
                    description: signal.description.clone(),
                    domain: signal.domain,
                    aggregation: signal.aggregation.clone(),
                    format: signal.format.clone(),
                    behavior: signal.behavior.clone(),
                })
            })
            .collect()
    }

    fn control_info(&self, names: &[String]) -> Result<Vec<ControlInfo>> {
        names
            .iter()
            .map(|name| {
                let control = self
                    .control(name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown control name: {}", name))?;
                Ok(ControlInfo {
                    name: control.name.clone(),
                    description: control.description.clone(),
                    domain: control.domain,
                })
            })
            .collect()
    }

    fn read_signal(&self, name: &str, domain: Domain, domain_idx: u32) -> Result<f64> {
        self.check_index(domain, domain_idx)?;
        if let Some(control) = self.control(name) {
            let state = self.state();
            return Ok(self.control_value(&state, control, domain, domain_idx));
        }
        match self.signal(name) {
            Some(signal) => Ok(signal.value),
            None => bail!("Unknown signal name: {}", name),
        }
    }

    fn write_control(&self, name: &str, domain: Domain, domain_idx: u32, value: f64) -> Result<()> {
        self.check_index(domain, domain_idx)?;
        if self.control(name).is_none() {
            bail!("Unknown control name: {}", name);
        }
        self.state()
            .settings
            .insert((name.to_string(), domain, domain_idx), value);
        Ok(())
    }

    fn save_control_dir(&self, dir: &Path) -> Result<()> {
        let saved: Vec<SavedControl> = {
            let state = self.state();
            self.catalog
                .controls
                .iter()
                .flat_map(|control| {
                    (0..self.catalog.domain_count(control.domain)).map(|idx| SavedControl {
                        name: control.name.clone(),
                        domain: control.domain,
                        domain_idx: idx,
                        value: self.control_value(&state, control, control.domain, idx),
                    })
                })
                .collect()
        };
        let json = serde_json::to_string_pretty(&saved)?;
        secure_make_file(&dir.join(SAVED_CONTROLS_FILE), json.as_bytes())?;
        daemon_log(
            "catalog_io",
            &format!("Saved {} control settings to {}", saved.len(), dir.display()),
        );
        Ok(())
    }

    fn restore_control_dir(&self, dir: &Path) -> Result<()> {
        let path = dir.join(SAVED_CONTROLS_FILE);
        let json = secure_read_file(&path)?
            .ok_or_else(|| anyhow::anyhow!("No saved controls in {}", dir.display()))?;
        let saved: Vec<SavedControl> = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let mut state = self.state();
        // Drop writes made at other domains so reads fall back to the snapshot.
        state.settings.clear();
        for entry in &saved {
            state
                .settings
                .insert((entry.name.clone(), entry.domain, entry.domain_idx), entry.value);
        }
        daemon_log(
            "catalog_io",
            &format!("Restored {} control settings from {}", saved.len(), dir.display()),
        );
        Ok(())
    }

    fn start_batch_server(
        &self,
        client_pid: u32,
        signal_config: &[BatchRequest],
        control_config: &[BatchRequest],
    ) -> Result<(u32, String)> {
        for request in signal_config {
            if self.signal(&request.name).is_none() && self.control(&request.name).is_none() {
                bail!("Unknown signal name: {}", request.name);
            }
            self.check_index(request.domain, request.domain_idx)?;
        }
        for request in control_config {
            if self.control(&request.name).is_none() {
                bail!("Unknown control name: {}", request.name);
            }
            self.check_index(request.domain, request.domain_idx)?;
        }
        let mut state = self.state();
        let server_pid = state.next_batch_pid;
        state.next_batch_pid += 1;
        state.batch_servers.insert(server_pid, client_pid);
        daemon_log(
            "catalog_io",
            &format!("Started batch server {} for client {}", server_pid, client_pid),
        );
        Ok((server_pid, server_pid.to_string()))
    }

    fn stop_batch_server(&self, server_pid: u32) -> Result<()> {
        match self.state().batch_servers.remove(&server_pid) {
            Some(client_pid) => {
                daemon_log(
                    "catalog_io",
                    &format!("Stopped batch server {} of client {}", server_pid, client_pid),
                );
                Ok(())
            }
            None => bail!("No batch server with PID {}", server_pid),
        }
    }
}

#[cfg(test)]
#[path = "tests/catalog_tests.rs"]
mod catalog_tests;
