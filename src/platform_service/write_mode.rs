//! Write-mode transitions of the platform service.
//!
//! The control lock holds the write identity of the single writer. While
//! it is held, `SAVE_FILES/` in the run root holds the control settings
//! from before the first write, and they are restored when write mode ends.

use super::PlatformService;
use crate::daemon_log::{daemon_log, service_warning};
use crate::error::{ServiceError, ServiceResult};
use crate::secure_files::secure_make_dirs;
use crate::service_paths::{control_lock_path, save_dir, SAVE_DIR_MODE};
use crate::write_lock::WriteLock;
use anyhow::Context;
use std::path::Path;

impl PlatformService {
    /// Identity a client writes under: remembered from its transition, or
    /// its pid (session id when sharing by sid is configured).
    fn write_identity(&self, pid: u32) -> u32 {
        if let Some(identity) = self.write_identities.get(&pid) {
            return *identity;
        }
        if self.share_write_lock_by_sid {
            self.process_table.session_id(pid).unwrap_or(pid)
        } else {
            pid
        }
    }

    /// Whether some live client with an open session writes as `identity`.
    fn is_identity_alive(&self, identity: u32) -> bool {
        self.active_sessions
            .get_clients()
            .into_iter()
            .any(|pid| self.write_identity(pid) == identity && self.process_table.exists(pid))
    }

    /// Makes `pid` the write owner unless it already is. A remembered
    /// identity counts only while the lock file still names it.
    pub(super) fn ensure_write_mode(&mut self, pid: u32) -> ServiceResult<()> {
        if self.control_locked {
            service_warning(&format!(
                "Write mode request from client {} denied, control is locked",
                pid
            ));
            return Err(ServiceError::ControlLocked);
        }
        let mut lock = WriteLock::acquire(&control_lock_path(&self.run_root))?;
        let current = lock.try_lock(None).map_err(ServiceError::internal)?;
        if let Some(remembered) = self.write_identities.get(&pid).copied() {
            if current == Some(remembered) {
                return Ok(());
            }
            self.write_identities.remove(&pid);
        }
        let identity = self.write_identity(pid);
        match current {
            Some(owner) if owner == identity => {
                self.write_identities.insert(pid, identity);
                return Ok(());
            }
            Some(owner) if self.is_identity_alive(owner) => {
                service_warning(&format!(
                    "Write mode request from client {} denied, the geopm service \
                     already has write mode client with PID or SID of {}",
                    pid, owner
                ));
                return Err(ServiceError::WriteBusy { owner });
            }
            Some(owner) => {
                service_warning(&format!(
                    "Write mode owner {} is no longer running, restoring its saved controls",
                    owner
                ));
                if let Err(err) = self.restore_and_unlock(&mut lock, owner) {
                    service_warning(&format!(
                        "Failed to restore controls of stale owner {}: {}",
                        owner, err
                    ));
                }
            }
            None => self.discard_stale_save_dir(),
        }

        claim_lock(&mut lock, identity)?;
        let save = save_dir(&self.run_root);
        let saved = secure_make_dirs(&save, SAVE_DIR_MODE)
            .map_err(ServiceError::internal)
            .and_then(|()| {
                self.io
                    .save_control_dir(&save)
                    .map_err(ServiceError::hardware)
            });
        if let Err(err) = saved {
            if let Err(cleanup) = remove_save_dir(&save) {
                service_warning(&format!("{:#}", cleanup));
            }
            if let Err(unlock) = lock.unlock(identity) {
                service_warning(&format!("{:#}", unlock));
            }
            return Err(err);
        }
        self.write_identities.insert(pid, identity);
        daemon_log(
            "write_mode",
            &format!("Client {} entered write mode as {}", pid, identity),
        );
        Ok(())
    }

    /// A save directory without a lock owner is left over from a crash
    /// between save and lock; it cannot be trusted.
    fn discard_stale_save_dir(&self) {
        let save = save_dir(&self.run_root);
        if save.exists() {
            service_warning(&format!(
                "Removing {} left behind without a write mode owner",
                save.display()
            ));
            if let Err(err) = remove_save_dir(&save) {
                service_warning(&format!("{:#}", err));
            }
        }
    }

    /// Restores the snapshot, removes it and clears the lock held by
    /// `owner`. The lock is cleared even if the restore fails.
    fn restore_and_unlock(&mut self, lock: &mut WriteLock, owner: u32) -> ServiceResult<()> {
        let save = save_dir(&self.run_root);
        let restored = if save.exists() {
            self.io
                .restore_control_dir(&save)
                .map_err(ServiceError::hardware)
        } else {
            service_warning(&format!(
                "No saved controls to restore for write mode owner {}",
                owner
            ));
            Ok(())
        };
        let removed = remove_save_dir(&save).map_err(ServiceError::internal);
        lock.unlock(owner).map_err(ServiceError::internal)?;
        self.write_identities.retain(|_, identity| *identity != owner);
        daemon_log("write_mode", &format!("Write mode of {} ended", owner));
        restored.and(removed)
    }

    /// First step of a complete close: ends write mode if this client's
    /// identity owns it and no other open session shares that identity.
    pub(super) fn release_write_mode(&mut self, pid: u32) -> ServiceResult<()> {
        let identity = self.write_identity(pid);
        self.write_identities.remove(&pid);
        if self.write_identities.values().any(|other| *other == identity) {
            return Ok(());
        }
        let mut lock = WriteLock::acquire(&control_lock_path(&self.run_root))?;
        if lock.try_lock(None).map_err(ServiceError::internal)? == Some(identity) {
            self.restore_and_unlock(&mut lock, identity)?;
        }
        Ok(())
    }

    /// Reapplies the saved controls for the write owner. The lock and the
    /// save directory stay in place.
    pub fn restore_control(&mut self, pid: u32) -> ServiceResult<()> {
        self.active_sessions
            .check_client_active(pid, "restore_control")?;
        let identity = self.write_identity(pid);
        let mut lock = WriteLock::acquire(&control_lock_path(&self.run_root))?;
        let owner = lock.try_lock(None).map_err(ServiceError::internal)?;
        if owner != Some(identity) {
            return Err(ServiceError::invalid(format!(
                "Client {} does not hold the write lock",
                pid
            )));
        }
        self.io
            .restore_control_dir(&save_dir(&self.run_root))
            .map_err(ServiceError::hardware)?;
        daemon_log("write_mode", &format!("Restored controls for client {}", pid));
        Ok(())
    }

    /// Blocks write mode system wide and ends the current write session.
    /// Every client loses write mode even when the restore fails.
    pub fn lock_control(&mut self) -> ServiceResult<()> {
        self.control_locked = true;
        let ended = self.end_current_write_mode();
        self.write_identities.clear();
        daemon_log("write_mode", "Control locked by administrator");
        ended
    }

    fn end_current_write_mode(&mut self) -> ServiceResult<()> {
        let mut lock = WriteLock::acquire(&control_lock_path(&self.run_root))?;
        match lock.try_lock(None).map_err(ServiceError::internal)? {
            Some(owner) => self.restore_and_unlock(&mut lock, owner),
            None => Ok(()),
        }
    }

    pub fn unlock_control(&mut self) {
        self.control_locked = false;
        daemon_log("write_mode", "Control unlocked by administrator");
    }
}

/// Writes `identity` into an empty lock. Fails with the owner's identity
/// if someone else got there first.
pub(super) fn claim_lock(lock: &mut WriteLock, identity: u32) -> ServiceResult<()> {
    match lock.try_lock(Some(identity)).map_err(ServiceError::internal)? {
        Some(owner) if owner == identity => Ok(()),
        Some(owner) => {
            service_warning(&format!(
                "Control lock is held by {}, write mode for {} refused",
                owner, identity
            ));
            Err(ServiceError::WriteBusy { owner })
        }
        None => Err(ServiceError::internal(anyhow::anyhow!(
            "Control lock is still empty after claiming it for {}",
            identity
        ))),
    }
}

fn remove_save_dir(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
