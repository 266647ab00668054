//! Hardware I/O seam.
//!
//! The service never touches hardware itself: every read, write, save,
//! restore and batch server goes through a [`PlatformIo`] implementation.

pub mod catalog;

pub use catalog::{Catalog, CatalogIo};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hardware domain a signal or control is addressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Board,
    Package,
    Core,
    Cpu,
    Memory,
    PackageIntegratedMemory,
    Nic,
    PackageIntegratedNic,
    Gpu,
    PackageIntegratedGpu,
    GpuChip,
}

impl Domain {
    pub const ALL: [Domain; 11] = [
        Domain::Board,
        Domain::Package,
        Domain::Core,
        Domain::Cpu,
        Domain::Memory,
        Domain::PackageIntegratedMemory,
        Domain::Nic,
        Domain::PackageIntegratedNic,
        Domain::Gpu,
        Domain::PackageIntegratedGpu,
        Domain::GpuChip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Board => "board",
            Domain::Package => "package",
            Domain::Core => "core",
            Domain::Cpu => "cpu",
            Domain::Memory => "memory",
            Domain::PackageIntegratedMemory => "package_integrated_memory",
            Domain::Nic => "nic",
            Domain::PackageIntegratedNic => "package_integrated_nic",
            Domain::Gpu => "gpu",
            Domain::PackageIntegratedGpu => "package_integrated_gpu",
            Domain::GpuChip => "gpu_chip",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Domain {
    type Err = anyhow::Error;

    /// Accepts `board`, `BOARD` and `GEOPM_DOMAIN_BOARD` spellings.
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        let name = lower.strip_prefix("geopm_domain_").unwrap_or(&lower);
        Domain::ALL
            .into_iter()
            .find(|domain| domain.as_str() == name)
            .ok_or_else(|| anyhow::anyhow!("Unknown domain: {}", s))
    }
}

/// Description of one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub name: String,
    pub description: String,
    pub domain: Domain,
    pub aggregation: String,
    pub format: String,
    pub behavior: String,
}

/// Description of one control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlInfo {
    pub name: String,
    pub description: String,
    pub domain: Domain,
}

/// One entry of a batch server signal or control configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub domain: Domain,
    pub domain_idx: u32,
    pub name: String,
}

/// Hardware I/O collaborator of the platform service.
pub trait PlatformIo: Send + Sync {
    fn signal_names(&self) -> Vec<String>;

    fn control_names(&self) -> Vec<String>;

    fn signal_info(&self, names: &[String]) -> Result<Vec<SignalInfo>>;

    fn control_info(&self, names: &[String]) -> Result<Vec<ControlInfo>>;

    fn read_signal(&self, name: &str, domain: Domain, domain_idx: u32) -> Result<f64>;

    fn write_control(&self, name: &str, domain: Domain, domain_idx: u32, value: f64) -> Result<()>;

    /// Snapshots every writable control into `dir`.
    fn save_control_dir(&self, dir: &Path) -> Result<()>;

    /// Reapplies the snapshot stored in `dir`.
    fn restore_control_dir(&self, dir: &Path) -> Result<()>;

    /// Starts a batch server for `client_pid`; returns `(server_pid, server_key)`.
    fn start_batch_server(
        &self,
        client_pid: u32,
        signal_config: &[BatchRequest],
        control_config: &[BatchRequest],
    ) -> Result<(u32, String)>;

    fn stop_batch_server(&self, server_pid: u32) -> Result<()>;
}
