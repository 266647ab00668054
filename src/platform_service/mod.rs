//! Request handler of the daemon.
//!
//! Every client call enters here with the caller's pid (and user name for
//! `open_session`). The service checks the call against the session's
//! allow-lists, escalates to write mode through the control lock when a
//! client first writes, and tears sessions down on close or client exit.

mod write_mode;

use crate::access_lists::{Access, AccessLists, AccountDb};
use crate::active_sessions::ActiveSessions;
use crate::config::ServiceConfig;
use crate::daemon_log::{daemon_log, service_warning};
use crate::error::{AccessKind, ServiceError, ServiceResult};
use crate::lifecycle_watcher::ClientWatcher;
use crate::platform_io::{BatchRequest, ControlInfo, Domain, PlatformIo, SignalInfo};
use crate::process_table::ProcessTable;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

pub struct PlatformService {
    io: Arc<dyn PlatformIo>,
    access_lists: AccessLists,
    active_sessions: ActiveSessions,
    process_table: Arc<dyn ProcessTable>,
    watcher: Arc<dyn ClientWatcher>,
    run_root: PathBuf,
    share_write_lock_by_sid: bool,
    /// Set by `lock_control`; blocks every write-mode transition.
    control_locked: bool,
    /// Write identity (pid or sid) of each client that entered write mode.
    write_identities: HashMap<u32, u32>,
}

impl PlatformService {
    /// Loads access lists and persisted sessions, then renews the liveness
    /// watch of every restored session.
    pub fn new(
        config: &ServiceConfig,
        io: Arc<dyn PlatformIo>,
        accounts: Arc<dyn AccountDb>,
        process_table: Arc<dyn ProcessTable>,
        watcher: Arc<dyn ClientWatcher>,
    ) -> anyhow::Result<Self> {
        let access_lists = AccessLists::new(&config.config_root, Arc::clone(&io), accounts)?;
        let active_sessions = ActiveSessions::new(
            &config.run_root,
            Arc::clone(&process_table),
            config.audit_removed_sessions,
        )?;
        let mut service = Self {
            io,
            access_lists,
            active_sessions,
            process_table,
            watcher,
            run_root: config.run_root.clone(),
            share_write_lock_by_sid: config.share_write_lock_by_sid,
            control_locked: false,
            write_identities: HashMap::new(),
        };
        for pid in service.active_sessions.get_clients() {
            let watch_id = service.watcher.watch(pid);
            service.active_sessions.set_watch_id(pid, watch_id)?;
        }
        Ok(service)
    }

    /// Opens a session or adds a reference to the caller's existing one.
    pub fn open_session(&mut self, user: &str, pid: u32) -> ServiceResult<()> {
        if self.active_sessions.is_client_active(pid) {
            self.active_sessions.increment_reference_count(pid)?;
            return Ok(());
        }
        let (signals, controls) = self.access_lists.get_user_access(user)?;
        let watch_id = self.watcher.watch(pid);
        if let Err(err) = self
            .active_sessions
            .add_client(pid, &signals, &controls, watch_id)
        {
            self.watcher.cancel(watch_id);
            return Err(err);
        }
        daemon_log(
            "service",
            &format!("Opened session for {} (PID {})", user, pid),
        );
        Ok(())
    }

    /// Drops one reference; the last one tears the session down. Closing a
    /// session that does not exist is a warning, not an error.
    pub fn close_session(&mut self, pid: u32) -> ServiceResult<()> {
        if !self.active_sessions.is_client_active(pid) {
            service_warning(&format!(
                "Attempt to close a session that does not exist, client PID: {}",
                pid
            ));
            self.complete_close(pid);
            return Ok(());
        }
        if self.active_sessions.decrement_reference_count(pid)? == 0 {
            self.complete_close(pid);
        }
        Ok(())
    }

    /// Entry point of the lifecycle watcher: the client is gone, so the
    /// session ends no matter how many references it had.
    pub fn handle_client_exit(&mut self, pid: u32) {
        daemon_log("service", &format!("Closing session of exited client {}", pid));
        self.complete_close(pid);
    }

    /// Releases write mode, stops the batch server, cancels the watch and
    /// removes the session. Each step runs even if an earlier one failed.
    fn complete_close(&mut self, pid: u32) {
        if let Err(err) = self.release_write_mode(pid) {
            service_warning(&format!(
                "Failed to release write mode of client {}: {}",
                pid, err
            ));
        }
        if let Ok(Some(server_pid)) = self.active_sessions.get_batch_server(pid) {
            if let Err(err) = self.io.stop_batch_server(server_pid) {
                service_warning(&format!(
                    "Failed to stop batch server {} of client {}: {:#}",
                    server_pid, pid, err
                ));
            }
            if let Err(err) = self.active_sessions.remove_batch_server(pid) {
                service_warning(&format!(
                    "Failed to remove batch server {} of client {}: {}",
                    server_pid, pid, err
                ));
            }
        }
        if let Ok(watch_id) = self.active_sessions.get_watch_id(pid) {
            self.watcher.cancel(watch_id);
        }
        if let Err(err) = self.active_sessions.remove_client(pid) {
            service_warning(&format!(
                "Failed to remove session of client {}: {}",
                pid, err
            ));
        }
    }

    pub fn get_signal_info(&self, names: &[String]) -> ServiceResult<Vec<SignalInfo>> {
        self.io.signal_info(names).map_err(ServiceError::hardware)
    }

    pub fn get_control_info(&self, names: &[String]) -> ServiceResult<Vec<ControlInfo>> {
        self.io.control_info(names).map_err(ServiceError::hardware)
    }

    /// Reads a signal on behalf of a session. Requests without a session or
    /// outside the allow-list read as NaN.
    pub fn read_signal(
        &self,
        pid: u32,
        name: &str,
        domain: Domain,
        domain_idx: u32,
    ) -> ServiceResult<f64> {
        if !self.active_sessions.is_client_active(pid) {
            service_warning(&format!(
                "Operation read_signal not allowed without an open session, client PID: {}",
                pid
            ));
            return Ok(f64::NAN);
        }
        if !self.active_sessions.get_signals(pid)?.iter().any(|s| s == name) {
            service_warning(&format!(
                "Requested signal that is not allowed by client {}: {}",
                pid, name
            ));
            return Ok(f64::NAN);
        }
        self.io
            .read_signal(name, domain, domain_idx)
            .map_err(ServiceError::hardware)
    }

    /// Writes a control, entering write mode on the session's first write.
    pub fn write_control(
        &mut self,
        pid: u32,
        name: &str,
        domain: Domain,
        domain_idx: u32,
        value: f64,
    ) -> ServiceResult<()> {
        self.active_sessions.check_client_active(pid, "write_control")?;
        if !self.active_sessions.get_controls(pid)?.iter().any(|c| c == name) {
            service_warning(&format!(
                "Requested control that is not allowed by client {}: {}",
                pid, name
            ));
            return Err(ServiceError::AccessDenied {
                kind: AccessKind::Control,
                names: vec![name.to_string()],
            });
        }
        self.ensure_write_mode(pid)?;
        self.io
            .write_control(name, domain, domain_idx, value)
            .map_err(ServiceError::hardware)
    }

    /// Starts the session's batch server; control requests need write mode.
    pub fn start_batch(
        &mut self,
        pid: u32,
        signal_config: &[BatchRequest],
        control_config: &[BatchRequest],
    ) -> ServiceResult<(u32, String)> {
        self.active_sessions.check_client_active(pid, "start_batch")?;
        check_allowed(
            AccessKind::Signal,
            signal_config,
            &self.active_sessions.get_signals(pid)?,
        )?;
        check_allowed(
            AccessKind::Control,
            control_config,
            &self.active_sessions.get_controls(pid)?,
        )?;
        if let Some(existing) = self.active_sessions.get_batch_server(pid)? {
            return Err(ServiceError::invalid(format!(
                "Client {} already has an active batch server: {}",
                pid, existing
            )));
        }
        if !control_config.is_empty() {
            self.ensure_write_mode(pid)?;
        }
        let (server_pid, server_key) = self
            .io
            .start_batch_server(pid, signal_config, control_config)
            .map_err(ServiceError::hardware)?;
        if let Err(err) = self.active_sessions.set_batch_server(pid, server_pid) {
            let _ = self.io.stop_batch_server(server_pid);
            return Err(err);
        }
        daemon_log(
            "service",
            &format!("Client {} started batch server {}", pid, server_pid),
        );
        Ok((server_pid, server_key))
    }

    /// Stops a batch server the session owns; any other pid is a warning.
    pub fn stop_batch(&mut self, pid: u32, server_pid: u32) -> ServiceResult<()> {
        self.active_sessions.check_client_active(pid, "stop_batch")?;
        if self.active_sessions.get_batch_server(pid)? != Some(server_pid) {
            service_warning(&format!(
                "Client {} requested to stop batch server {} which it does not own",
                pid, server_pid
            ));
            return Ok(());
        }
        let stopped = self
            .io
            .stop_batch_server(server_pid)
            .map_err(ServiceError::hardware);
        self.active_sessions.remove_batch_server(pid)?;
        stopped
    }

    pub fn start_profile(&mut self, pid: u32, profile_name: &str) -> ServiceResult<()> {
        self.active_sessions.check_client_active(pid, "start_profile")?;
        self.active_sessions.start_profile(pid, profile_name)
    }

    pub fn stop_profile(&mut self, pid: u32, region_names: &[String]) -> ServiceResult<()> {
        self.active_sessions.check_client_active(pid, "stop_profile")?;
        self.active_sessions.stop_profile(pid, region_names)
    }

    pub fn get_profile_pids(
        &self,
        pid: u32,
        profile_name: &str,
    ) -> ServiceResult<Option<Vec<u32>>> {
        self.active_sessions.check_client_active(pid, "get_profile_pids")?;
        Ok(self.active_sessions.get_profile_pids(profile_name))
    }

    pub fn pop_profile_region_names(
        &mut self,
        pid: u32,
        profile_name: &str,
    ) -> ServiceResult<Vec<String>> {
        self.active_sessions
            .check_client_active(pid, "pop_profile_region_names")?;
        Ok(self.active_sessions.pop_profile_region_names(profile_name))
    }

    pub fn get_group_access(&self, group: &str) -> ServiceResult<Access> {
        self.access_lists.get_group_access(group)
    }

    pub fn set_group_access(
        &self,
        group: &str,
        signals: &[String],
        controls: &[String],
    ) -> ServiceResult<()> {
        self.access_lists.set_group_access(group, signals, controls)
    }

    pub fn set_group_access_signals(&self, group: &str, signals: &[String]) -> ServiceResult<()> {
        self.access_lists.set_group_access_signals(group, signals)
    }

    pub fn set_group_access_controls(&self, group: &str, controls: &[String]) -> ServiceResult<()> {
        self.access_lists.set_group_access_controls(group, controls)
    }

    pub fn get_user_access(&self, user: &str) -> ServiceResult<Access> {
        self.access_lists.get_user_access(user)
    }

    pub fn get_all_access(&self) -> Access {
        self.access_lists.get_all_access()
    }
}

/// Fails with the sorted names in `requests` that `allowed` lacks.
fn check_allowed(
    kind: AccessKind,
    requests: &[BatchRequest],
    allowed: &[String],
) -> ServiceResult<()> {
    let denied: BTreeSet<&str> = requests
        .iter()
        .map(|request| request.name.as_str())
        .filter(|name| !allowed.iter().any(|a| a == name))
        .collect();
    if denied.is_empty() {
        return Ok(());
    }
    let names: Vec<String> = denied.into_iter().map(str::to_string).collect();
    service_warning(&format!(
        "Requested {}s that are not allowed: {}",
        kind,
        names.join(", ")
    ));
    Err(ServiceError::AccessDenied { kind, names })
}

#[cfg(test)]
#[path = "tests/platform_service_tests.rs"]
mod platform_service_tests;

#[cfg(test)]
#[path = "tests/scenario_tests.rs"]
mod scenario_tests;
