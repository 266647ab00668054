//! Registry of open client sessions, mirrored to `session-<pid>.json`.
//!
//! Every mutation is written through SecureFiles before it is applied to
//! the in-memory map, so after a crash the files on disk never describe
//! less than what clients were told. On startup the files are reloaded and
//! any whose client is gone, or whose pid was recycled after the file was
//! written, is quarantined.

pub mod record;

pub use record::{file_ctime, SessionRecord};

use crate::daemon_log::{daemon_log, service_warning};
use crate::error::{ServiceError, ServiceResult};
use crate::process_table::ProcessTable;
use crate::secure_files::{
    quarantine, quarantine_invalid, remove_if_exists, secure_make_dirs, secure_make_file,
    secure_read, REMOVE_SUFFIX,
};
use crate::service_paths::{
    batch_server_paths, parse_session_file_name, profile_record_log_path, profile_status_path,
    session_path, RUN_ROOT_MODE,
};
use anyhow::Context;
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

pub struct ActiveSessions {
    run_root: PathBuf,
    sessions: BTreeMap<u32, SessionRecord>,
    /// Profile name to the pids currently profiling under it.
    profiles: BTreeMap<String, BTreeSet<u32>>,
    /// Region names reported by clients that left a profile.
    region_names: BTreeMap<String, BTreeSet<String>>,
    process_table: Arc<dyn ProcessTable>,
    audit_removed: bool,
}

impl ActiveSessions {
    /// Ensures the run root and reloads every valid session file in it.
    pub fn new(
        run_root: &Path,
        process_table: Arc<dyn ProcessTable>,
        audit_removed: bool,
    ) -> anyhow::Result<Self> {
        secure_make_dirs(run_root, RUN_ROOT_MODE)?;
        let mut sessions = Self {
            run_root: run_root.to_path_buf(),
            sessions: BTreeMap::new(),
            profiles: BTreeMap::new(),
            region_names: BTreeMap::new(),
            process_table,
            audit_removed,
        };
        sessions.load()?;
        Ok(sessions)
    }

    fn load(&mut self) -> anyhow::Result<()> {
        let mut found: Vec<(u32, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.run_root)
            .with_context(|| format!("Failed to list {}", self.run_root.display()))?
        {
            let entry = entry?;
            if let Some(pid) = entry.file_name().to_str().and_then(parse_session_file_name) {
                found.push((pid, entry.path()));
            }
        }
        found.sort();

        for (pid, path) in found {
            if let Some(record) = self.load_session_file(pid, &path)? {
                self.write_session(&record)?;
                if let Some(name) = &record.profile_name {
                    self.profiles.entry(name.clone()).or_default().insert(pid);
                }
                daemon_log("sessions", &format!("Restored session for client {}", pid));
                self.sessions.insert(pid, record);
            }
        }
        Ok(())
    }

    /// Reads, parses and validates one session file. Anything invalid is
    /// quarantined and yields `None`.
    fn load_session_file(&self, pid: u32, path: &Path) -> anyhow::Result<Option<SessionRecord>> {
        let Some((contents, meta)) = secure_read(path)? else {
            return Ok(None);
        };
        let mut record: SessionRecord = match serde_json::from_str(&contents) {
            Ok(record) => record,
            Err(e) => {
                quarantine_invalid(path, &[format!("is not a valid session record: {}", e)])?;
                return Ok(None);
            }
        };
        let problems = record.problems(pid);
        if !problems.is_empty() {
            quarantine_invalid(path, &problems)?;
            return Ok(None);
        }
        let written = file_ctime(&meta);
        if !self.is_pid_valid(record.client_pid, written) {
            quarantine_invalid(
                path,
                &[format!(
                    "names client {} which is not running or was started after the file \
                     was written",
                    record.client_pid
                )],
            )?;
            return Ok(None);
        }
        if let Some(server) = record.batch_server {
            if !self.is_pid_valid(server, written) {
                service_warning(&format!(
                    "Batch server {} of client {} is no longer running, dropping it",
                    server, pid
                ));
                record.batch_server = None;
            }
        }
        Ok(Some(record))
    }

    /// A pid is the process a file refers to only if that process existed
    /// before the file was last changed. The creation time is only known to
    /// within the table's resolution, and the latest possible creation must
    /// still precede the write.
    fn is_pid_valid(&self, pid: u32, written: SystemTime) -> bool {
        let resolution = self.process_table.create_time_resolution();
        self.process_table
            .create_time(pid)
            .is_some_and(|created| created + resolution < written)
    }

    fn write_session(&self, record: &SessionRecord) -> anyhow::Result<()> {
        let json = serde_json::to_string(record)?;
        secure_make_file(&session_path(&self.run_root, record.client_pid), json.as_bytes())
    }

    fn record(&self, pid: u32, operation: &str) -> ServiceResult<&SessionRecord> {
        self.sessions.get(&pid).ok_or_else(|| ServiceError::SessionMissing {
            pid,
            operation: operation.to_string(),
        })
    }

    /// Applies `mutate` to a copy of the session, persists it, then commits.
    fn update<F>(&mut self, pid: u32, operation: &str, mutate: F) -> ServiceResult<()>
    where
        F: FnOnce(&mut SessionRecord) -> ServiceResult<()>,
    {
        let mut record = self.record(pid, operation)?.clone();
        mutate(&mut record)?;
        self.write_session(&record).map_err(ServiceError::internal)?;
        self.sessions.insert(pid, record);
        Ok(())
    }

    /// Creates a session with one reference. No-op if it already exists.
    pub fn add_client(
        &mut self,
        pid: u32,
        signals: &[String],
        controls: &[String],
        watch_id: u64,
    ) -> ServiceResult<()> {
        if self.sessions.contains_key(&pid) {
            return Ok(());
        }
        let record = SessionRecord::new(pid, signals, controls, watch_id);
        self.write_session(&record).map_err(ServiceError::internal)?;
        self.sessions.insert(pid, record);
        daemon_log("sessions", &format!("Added session for client {}", pid));
        Ok(())
    }

    /// Forgets a session and its profile membership. Silent if absent.
    pub fn remove_client(&mut self, pid: u32) -> ServiceResult<()> {
        let path = session_path(&self.run_root, pid);
        let removed = match quarantine(&path, REMOVE_SUFFIX) {
            Ok(removed) => Some(removed),
            Err(e) if is_not_found(&e) => None,
            Err(e) => return Err(ServiceError::internal(e)),
        };
        let on_disk = match &removed {
            Some(removed) => self.read_removed(removed),
            None => None,
        };
        let record = self.sessions.remove(&pid).or(on_disk);

        if let Some(name) = record.and_then(|r| r.profile_name) {
            self.leave_profile(&name, pid);
        }
        self.remove_profile_files(pid)?;

        if let Some(removed) = removed {
            if !self.audit_removed {
                remove_if_exists(&removed).map_err(ServiceError::internal)?;
            }
            daemon_log("sessions", &format!("Removed session for client {}", pid));
        }
        Ok(())
    }

    /// Last look at a session file being removed.
    fn read_removed(&self, path: &Path) -> Option<SessionRecord> {
        match secure_read(path) {
            Ok(Some((contents, _))) => serde_json::from_str(&contents).ok(),
            Ok(None) => None,
            Err(e) => {
                service_warning(&format!("Unable to read {}: {:#}", path.display(), e));
                None
            }
        }
    }

    /// Whether `pid` has an open session. A session file left behind for a
    /// pid that has none is quarantined.
    pub fn is_client_active(&self, pid: u32) -> bool {
        if self.sessions.contains_key(&pid) {
            return true;
        }
        let path = session_path(&self.run_root, pid);
        if std::fs::symlink_metadata(&path).is_ok() {
            let problem = "exists for a client without an open session".to_string();
            if let Err(e) = quarantine_invalid(&path, &[problem]) {
                service_warning(&format!("Unable to quarantine {}: {:#}", path.display(), e));
            }
        }
        false
    }

    pub fn check_client_active(&self, pid: u32, operation: &str) -> ServiceResult<()> {
        if self.is_client_active(pid) {
            Ok(())
        } else {
            Err(ServiceError::SessionMissing {
                pid,
                operation: operation.to_string(),
            })
        }
    }

    pub fn get_clients(&self) -> Vec<u32> {
        self.sessions.keys().copied().collect()
    }

    pub fn get_signals(&self, pid: u32) -> ServiceResult<Vec<String>> {
        Ok(self.record(pid, "get_signals")?.signals.iter().cloned().collect())
    }

    pub fn get_controls(&self, pid: u32) -> ServiceResult<Vec<String>> {
        Ok(self.record(pid, "get_controls")?.controls.iter().cloned().collect())
    }

    pub fn get_watch_id(&self, pid: u32) -> ServiceResult<u64> {
        Ok(self.record(pid, "get_watch_id")?.watch_id)
    }

    pub fn set_watch_id(&mut self, pid: u32, watch_id: u64) -> ServiceResult<()> {
        self.update(pid, "set_watch_id", |record| {
            record.watch_id = watch_id;
            Ok(())
        })
    }

    pub fn get_reference_count(&self, pid: u32) -> ServiceResult<u32> {
        Ok(self.record(pid, "get_reference_count")?.reference_count)
    }

    /// Sets the open count; zero is rejected, sessions end through close.
    pub fn set_reference_count(&mut self, pid: u32, count: u32) -> ServiceResult<()> {
        if count == 0 {
            return Err(ServiceError::invalid(format!(
                "Reference count of client {} must be positive",
                pid
            )));
        }
        self.update(pid, "set_reference_count", |record| {
            record.reference_count = count;
            Ok(())
        })
    }

    pub fn increment_reference_count(&mut self, pid: u32) -> ServiceResult<u32> {
        let count = self.get_reference_count(pid)?.saturating_add(1);
        self.set_reference_count(pid, count)?;
        Ok(count)
    }

    /// Returns the new count. Reaching zero only marks the session for
    /// destruction in memory; the caller is expected to remove it.
    pub fn decrement_reference_count(&mut self, pid: u32) -> ServiceResult<u32> {
        let count = self.get_reference_count(pid)?.saturating_sub(1);
        if count == 0 {
            if let Some(record) = self.sessions.get_mut(&pid) {
                record.reference_count = 0;
            }
            return Ok(0);
        }
        self.set_reference_count(pid, count)?;
        Ok(count)
    }

    pub fn get_batch_server(&self, pid: u32) -> ServiceResult<Option<u32>> {
        Ok(self.record(pid, "get_batch_server")?.batch_server)
    }

    pub fn set_batch_server(&mut self, pid: u32, server_pid: u32) -> ServiceResult<()> {
        self.update(pid, "set_batch_server", |record| match record.batch_server {
            Some(existing) => Err(ServiceError::invalid(format!(
                "Client {} already has an active batch server: {}",
                pid, existing
            ))),
            None => {
                record.batch_server = Some(server_pid);
                Ok(())
            }
        })
    }

    /// Clears the batch server and unlinks its buffers and FIFOs.
    pub fn remove_batch_server(&mut self, pid: u32) -> ServiceResult<()> {
        let Some(server_pid) = self.get_batch_server(pid)? else {
            return Ok(());
        };
        for path in batch_server_paths(&self.run_root, server_pid) {
            remove_if_exists(&path).map_err(ServiceError::internal)?;
        }
        self.update(pid, "remove_batch_server", |record| {
            record.batch_server = None;
            Ok(())
        })
    }

    /// Adds the client to a profile and creates its profile segments.
    pub fn start_profile(&mut self, pid: u32, profile_name: &str) -> ServiceResult<()> {
        if profile_name.is_empty() {
            return Err(ServiceError::invalid("Profile name must not be empty"));
        }
        if let Some(current) = &self.record(pid, "start_profile")?.profile_name {
            return Err(ServiceError::invalid(format!(
                "Client {} is already profiling as \"{}\"",
                pid, current
            )));
        }
        for path in [
            profile_status_path(&self.run_root, pid),
            profile_record_log_path(&self.run_root, pid),
        ] {
            secure_make_file(&path, b"").map_err(ServiceError::internal)?;
        }
        self.update(pid, "start_profile", |record| {
            record.profile_name = Some(profile_name.to_string());
            Ok(())
        })?;
        self.profiles
            .entry(profile_name.to_string())
            .or_default()
            .insert(pid);
        Ok(())
    }

    /// Removes the client from its profile, keeping the region names it
    /// reported for the profile's owner to collect.
    pub fn stop_profile(&mut self, pid: u32, region_names: &[String]) -> ServiceResult<()> {
        let Some(name) = self.record(pid, "stop_profile")?.profile_name.clone() else {
            return Err(ServiceError::invalid(format!(
                "Client {} is not profiling",
                pid
            )));
        };
        self.update(pid, "stop_profile", |record| {
            record.profile_name = None;
            Ok(())
        })?;
        self.leave_profile(&name, pid);
        self.region_names
            .entry(name)
            .or_default()
            .extend(region_names.iter().cloned());
        self.remove_profile_files(pid)
    }

    fn remove_profile_files(&self, pid: u32) -> ServiceResult<()> {
        remove_if_exists(&profile_status_path(&self.run_root, pid))
            .and_then(|_| remove_if_exists(&profile_record_log_path(&self.run_root, pid)))
            .map_err(ServiceError::internal)?;
        Ok(())
    }

    fn leave_profile(&mut self, name: &str, pid: u32) {
        if let Some(pids) = self.profiles.get_mut(name) {
            pids.remove(&pid);
            if pids.is_empty() {
                self.profiles.remove(name);
            }
        }
    }

    pub fn get_profile_pids(&self, profile_name: &str) -> Option<Vec<u32>> {
        self.profiles
            .get(profile_name)
            .map(|pids| pids.iter().copied().collect())
    }

    pub fn pop_profile_region_names(&mut self, profile_name: &str) -> Vec<String> {
        self.region_names
            .remove(profile_name)
            .map(|names| names.into_iter().collect())
            .unwrap_or_default()
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == ErrorKind::NotFound)
}

#[cfg(test)]
#[path = "tests/active_sessions_tests.rs"]
mod active_sessions_tests;
