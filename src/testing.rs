//! Deterministic collaborators shared by the unit tests.

use crate::access_lists::AccountDb;
use crate::lifecycle_watcher::ClientWatcher;
use crate::platform_io::{
    BatchRequest, Catalog, CatalogIo, ControlInfo, Domain, PlatformIo, SignalInfo,
};
use crate::process_table::ProcessTable;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Creation time of fake processes: long before any file in a test root.
pub fn long_ago() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_000_000)
}

#[derive(Clone, Copy)]
struct FakeProcess {
    created: SystemTime,
    sid: u32,
}

/// Process table whose processes are declared by the test.
#[derive(Default)]
pub struct FakeProcessTable {
    processes: Mutex<HashMap<u32, FakeProcess>>,
    resolution: Mutex<Duration>,
}

impl FakeProcessTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Declares a live process created long ago, its own session leader.
    pub fn spawn(&self, pid: u32) {
        self.spawn_at(pid, long_ago());
    }

    pub fn spawn_at(&self, pid: u32, created: SystemTime) {
        self.processes
            .lock()
            .unwrap()
            .insert(pid, FakeProcess { created, sid: pid });
    }

    pub fn set_sid(&self, pid: u32, sid: u32) {
        if let Some(process) = self.processes.lock().unwrap().get_mut(&pid) {
            process.sid = sid;
        }
    }

    pub fn kill(&self, pid: u32) {
        self.processes.lock().unwrap().remove(&pid);
    }

    pub fn set_create_time_resolution(&self, resolution: Duration) {
        *self.resolution.lock().unwrap() = resolution;
    }
}

impl ProcessTable for FakeProcessTable {
    fn create_time(&self, pid: u32) -> Option<SystemTime> {
        self.processes.lock().unwrap().get(&pid).map(|p| p.created)
    }

    fn create_time_resolution(&self) -> Duration {
        *self.resolution.lock().unwrap()
    }

    /// Nanoseconds of the creation time, unique per declared process.
    fn start_token(&self, pid: u32) -> Option<u64> {
        let created = self.create_time(pid)?;
        let since_epoch = created.duration_since(UNIX_EPOCH).unwrap_or_default();
        Some(since_epoch.as_nanos() as u64)
    }

    fn session_id(&self, pid: u32) -> Option<u32> {
        self.processes.lock().unwrap().get(&pid).map(|p| p.sid)
    }
}

/// Account database with explicitly declared users and groups.
#[derive(Default)]
pub struct FakeAccounts {
    groups: Mutex<BTreeSet<String>>,
    users: Mutex<BTreeMap<String, (u32, Vec<String>)>>,
}

impl FakeAccounts {
    pub fn new() -> Arc<Self> {
        let accounts = Self::default();
        accounts.add_user("root", 0, &["root"]);
        Arc::new(accounts)
    }

    pub fn add_group(&self, group: &str) {
        self.groups.lock().unwrap().insert(group.to_string());
    }

    pub fn add_user(&self, user: &str, uid: u32, groups: &[&str]) {
        for group in groups {
            self.add_group(group);
        }
        self.users.lock().unwrap().insert(
            user.to_string(),
            (uid, groups.iter().map(|g| g.to_string()).collect()),
        );
    }
}

impl AccountDb for FakeAccounts {
    fn group_exists(&self, group: &str) -> Result<bool> {
        Ok(self.groups.lock().unwrap().contains(group))
    }

    fn user_groups(&self, user: &str) -> Result<Option<Vec<String>>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .get(user)
            .map(|(_, groups)| groups.clone()))
    }

    fn user_name(&self, uid: u32) -> Result<Option<String>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .find(|(_, (id, _))| *id == uid)
            .map(|(name, _)| name.clone()))
    }
}

/// Watcher that only records watch and cancel calls.
#[derive(Default)]
pub struct RecordingWatcher {
    watches: Mutex<BTreeMap<u64, u32>>,
    cancelled: Mutex<Vec<u64>>,
    next_id: Mutex<u64>,
}

impl RecordingWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pids with a live (not cancelled) watch, sorted.
    pub fn watched_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.watches.lock().unwrap().values().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn cancelled(&self) -> Vec<u64> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl ClientWatcher for RecordingWatcher {
    fn watch(&self, pid: u32) -> u64 {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        self.watches.lock().unwrap().insert(*next, pid);
        *next
    }

    fn cancel(&self, watch_id: u64) {
        self.watches.lock().unwrap().remove(&watch_id);
        self.cancelled.lock().unwrap().push(watch_id);
    }
}

pub fn catalog_io() -> Arc<CatalogIo> {
    Arc::new(CatalogIo::new(Catalog::builtin().unwrap()))
}

/// Catalog platform whose control snapshots can be made to fail.
pub struct FlakyIo {
    pub inner: CatalogIo,
    pub fail_save: AtomicBool,
    pub fail_restore: AtomicBool,
}

impl FlakyIo {
    pub fn new(first_batch_pid: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: CatalogIo::with_first_batch_pid(
                Catalog::builtin().unwrap(),
                first_batch_pid,
            ),
            fail_save: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
        })
    }
}

impl PlatformIo for FlakyIo {
    fn signal_names(&self) -> Vec<String> {
        self.inner.signal_names()
    }

    fn control_names(&self) -> Vec<String> {
        self.inner.control_names()
    }

    fn signal_info(&self, names: &[String]) -> Result<Vec<SignalInfo>> {
        self.inner.signal_info(names)
    }

    fn control_info(&self, names: &[String]) -> Result<Vec<ControlInfo>> {
        self.inner.control_info(names)
    }

    fn read_signal(&self, name: &str, domain: Domain, domain_idx: u32) -> Result<f64> {
        self.inner.read_signal(name, domain, domain_idx)
    }

    fn write_control(
        &self,
        name: &str,
        domain: Domain,
        domain_idx: u32,
        value: f64,
    ) -> Result<()> {
        self.inner.write_control(name, domain, domain_idx, value)
    }

    fn save_control_dir(&self, dir: &Path) -> Result<()> {
        if self.fail_save.load(Ordering::SeqCst) {
            anyhow::bail!("Simulated save failure");
        }
        self.inner.save_control_dir(dir)
    }

    fn restore_control_dir(&self, dir: &Path) -> Result<()> {
        if self.fail_restore.load(Ordering::SeqCst) {
            anyhow::bail!("Simulated restore failure");
        }
        self.inner.restore_control_dir(dir)
    }

    fn start_batch_server(
        &self,
        client_pid: u32,
        signal_config: &[BatchRequest],
        control_config: &[BatchRequest],
    ) -> Result<(u32, String)> {
        self.inner
            .start_batch_server(client_pid, signal_config, control_config)
    }

    fn stop_batch_server(&self, server_pid: u32) -> Result<()> {
        self.inner.stop_batch_server(server_pid)
    }
}

/// A platform service over a temporary run and config root with fake
/// collaborators. Users: `alice` (group `power`) and `bob` (no groups).
pub struct ServiceHarness {
    pub dir: tempfile::TempDir,
    pub config: crate::config::ServiceConfig,
    pub io: Arc<FlakyIo>,
    pub accounts: Arc<FakeAccounts>,
    pub table: Arc<FakeProcessTable>,
    pub watcher: Arc<RecordingWatcher>,
}

impl ServiceHarness {
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::ServiceConfig {
            run_root: dir.path().join("run"),
            config_root: dir.path().join("etc"),
            socket_path: dir.path().join("geopm-service.sock"),
            ..crate::config::ServiceConfig::default()
        };
        let accounts = FakeAccounts::new();
        accounts.add_user("alice", 1000, &["alice", "power"]);
        accounts.add_user("bob", 1001, &["bob"]);
        Self {
            dir,
            config,
            io: FlakyIo::new(6001),
            accounts,
            table: FakeProcessTable::new(),
            watcher: RecordingWatcher::new(),
        }
    }

    /// Builds a service; the first call also grants `power` its lists.
    pub fn service(&self) -> crate::platform_service::PlatformService {
        let service = crate::platform_service::PlatformService::new(
            &self.config,
            self.io.clone(),
            self.accounts.clone(),
            self.table.clone(),
            self.watcher.clone(),
        )
        .unwrap();
        service
            .set_group_access(
                "power",
                &["TIME".to_string(), "ENERGY_PACKAGE".to_string()],
                &["CPU_FREQUENCY_MAX_CONTROL".to_string()],
            )
            .unwrap();
        service
    }

    pub fn lock_contents(&self) -> String {
        let path = crate::service_paths::control_lock_path(&self.config.run_root);
        std::fs::read_to_string(path).unwrap_or_default()
    }

    pub fn save_dir_exists(&self) -> bool {
        crate::service_paths::save_dir(&self.config.run_root).exists()
    }

    pub fn session_file_exists(&self, pid: u32) -> bool {
        crate::service_paths::session_path(&self.config.run_root, pid).exists()
    }
}
