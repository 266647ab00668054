//! Filesystem layout of the daemon's runtime and configuration roots.
//!
//! Runtime state lives under the run root (default `/run/geopm-service/`):
//! - `CONTROL_LOCK` - write lock file
//! - `session-<pid>.json` - one per active session
//! - `SAVE_FILES/` - control snapshot, present while the write lock is held
//! - batch-server buffers and FIFOs, profile segments
//!
//! Access lists live under the config root (default `/etc/geopm-service/`).

use std::path::{Path, PathBuf};

/// Default runtime directory.
pub const DEFAULT_RUN_ROOT: &str = "/run/geopm-service";

/// Default access-list directory.
pub const DEFAULT_CONFIG_ROOT: &str = "/etc/geopm-service";

/// Default RPC socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/geopm-service.sock";

/// Mode of the run root: traversable by clients, listable only by the daemon.
pub const RUN_ROOT_MODE: u32 = 0o711;

/// Mode of the config root and every group directory below it.
pub const CONFIG_ROOT_MODE: u32 = 0o700;

/// Mode of the control snapshot directory.
pub const SAVE_DIR_MODE: u32 = 0o700;

const CONTROL_LOCK_NAME: &str = "CONTROL_LOCK";
const SAVE_DIR_NAME: &str = "SAVE_FILES";
const SESSION_PREFIX: &str = "session-";
const SESSION_SUFFIX: &str = ".json";

/// Returns the control lock path: `<run_root>/CONTROL_LOCK`
pub fn control_lock_path(run_root: &Path) -> PathBuf {
    run_root.join(CONTROL_LOCK_NAME)
}

/// Returns the control snapshot directory: `<run_root>/SAVE_FILES`
pub fn save_dir(run_root: &Path) -> PathBuf {
    run_root.join(SAVE_DIR_NAME)
}

/// Returns the session file path: `<run_root>/session-<pid>.json`
pub fn session_path(run_root: &Path, client_pid: u32) -> PathBuf {
    run_root.join(format!("{}{}{}", SESSION_PREFIX, client_pid, SESSION_SUFFIX))
}

/// Extracts the pid from a session file name, if it is one.
///
/// Quarantined copies (`session-<pid>.json-<uuid>-INVALID`) do not match.
pub fn parse_session_file_name(name: &str) -> Option<u32> {
    name.strip_prefix(SESSION_PREFIX)?
        .strip_suffix(SESSION_SUFFIX)?
        .parse()
        .ok()
}

/// Returns every artifact a batch server owns for the given server pid.
///
/// Format: `geopm-service-batch-buffer-<pid>-{signal,control}` and
/// `batch-status-<pid>-{in,out}`.
pub fn batch_server_paths(run_root: &Path, server_pid: u32) -> Vec<PathBuf> {
    vec![
        run_root.join(format!("geopm-service-batch-buffer-{}-signal", server_pid)),
        run_root.join(format!("geopm-service-batch-buffer-{}-control", server_pid)),
        run_root.join(format!("batch-status-{}-in", server_pid)),
        run_root.join(format!("batch-status-{}-out", server_pid)),
    ]
}

/// Returns the profile status segment: `<run_root>/profile-status-<pid>`
pub fn profile_status_path(run_root: &Path, client_pid: u32) -> PathBuf {
    run_root.join(format!("profile-status-{}", client_pid))
}

/// Returns the profile record log segment: `<run_root>/profile-record-log-<pid>`
pub fn profile_record_log_path(run_root: &Path, client_pid: u32) -> PathBuf {
    run_root.join(format!("profile-record-log-{}", client_pid))
}

/// Returns the group directory: `<config_root>/<group>`
pub fn group_dir(config_root: &Path, group: &str) -> PathBuf {
    config_root.join(group)
}
