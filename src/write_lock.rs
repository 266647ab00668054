//! Single-writer arbitration through `<run_root>/CONTROL_LOCK`.
//!
//! The file is empty when write mode is free and holds the owner's decimal
//! write identity otherwise. All access happens inside a [`WriteLock`]
//! scope, which holds both a process-local registration (no nested scopes
//! for the same file) and an exclusive advisory lock on the descriptor.

use crate::daemon_log::{daemon_log, service_warning};
use crate::error::{ServiceError, ServiceResult};
use crate::secure_files::{
    file_violations, quarantine_invalid, UmaskGuard, RESTRICTIVE_UMASK, SECURE_FILE_MODE,
};
use anyhow::{bail, Context, Result};
use fs2::FileExt;
use nix::libc;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const OPEN_ATTEMPTS: usize = 2;

/// Lock files with a live scope in this process.
static HELD: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

fn register(path: &Path) -> bool {
    HELD.lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(path.to_path_buf())
}

fn deregister(path: &Path) {
    HELD.lock().unwrap_or_else(|e| e.into_inner()).remove(path);
}

/// Scoped access to the control lock file.
pub struct WriteLock {
    path: PathBuf,
    file: Option<File>,
}

impl WriteLock {
    /// Enters the scope, blocking until the advisory lock is granted.
    pub fn acquire(path: &Path) -> ServiceResult<Self> {
        if !register(path) {
            return Err(ServiceError::invalid(format!(
                "Attempt to modify control lock file {} while the lock is held by the same process",
                path.display()
            )));
        }
        match open_locked(path) {
            Ok(file) => Ok(Self {
                path: path.to_path_buf(),
                file: Some(file),
            }),
            Err(err) => {
                deregister(path);
                Err(ServiceError::internal(err))
            }
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Control lock file is closed"))
    }

    /// Current owner, or `None` when free. Unparseable contents count as free.
    fn read_owner(&mut self) -> Result<Option<u32>> {
        let path = self.path.clone();
        let file = self.file()?;
        file.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        match trimmed.parse::<u32>() {
            Ok(owner) => Ok(Some(owner)),
            Err(_) => {
                service_warning(&format!(
                    "Control lock file {} has invalid contents, treating write mode as free: {:?}",
                    path.display(),
                    trimmed
                ));
                Ok(None)
            }
        }
    }

    fn replace_contents(&mut self, contents: &str) -> Result<()> {
        let file = self.file()?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Claims write mode for `pid` if it is free.
    ///
    /// Returns the owner after the call: `pid` when claimed, the existing
    /// owner when held, `None` when free and no pid was given. A held lock
    /// is never modified.
    pub fn try_lock(&mut self, pid: Option<u32>) -> Result<Option<u32>> {
        if let Some(owner) = self.read_owner()? {
            return Ok(Some(owner));
        }
        let Some(pid) = pid else {
            return Ok(None);
        };
        self.replace_contents(&pid.to_string())?;
        daemon_log("write_lock", &format!("Write mode granted to {}", pid));
        Ok(Some(pid))
    }

    /// Releases write mode held by `pid`.
    pub fn unlock(&mut self, pid: u32) -> Result<()> {
        match self.read_owner()? {
            None => bail!("Lock is not held, but unlock requested by {}", pid),
            Some(owner) if owner != pid => {
                bail!("Lock is held by {}, but unlock requested by {}", owner, pid)
            }
            Some(_) => {
                self.replace_contents("")?;
                daemon_log("write_lock", &format!("Write mode released by {}", pid));
                Ok(())
            }
        }
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
            drop(file);
        }
        deregister(&self.path);
    }
}

/// Opens the lock file, quarantining and retrying once if it fails the
/// ownership and mode checks, then takes the advisory lock.
fn open_locked(path: &Path) -> Result<File> {
    for _ in 0..OPEN_ATTEMPTS {
        let opened = {
            let _umask = UmaskGuard::set(RESTRICTIVE_UMASK);
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(SECURE_FILE_MODE)
                .custom_flags(libc::O_NOFOLLOW)
                .open(path)
        };
        let mut file = match opened {
            Ok(file) => file,
            Err(e) if e.raw_os_error() == Some(libc::ELOOP) => {
                quarantine_invalid(path, &["is a symbolic link".to_string()])?;
                continue;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                bail!("Run directory for {} does not exist", path.display())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", path.display()));
            }
        };
        let meta = file
            .metadata()
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let problems = file_violations(&meta);
        if !problems.is_empty() {
            drop(file);
            quarantine_invalid(path, &problems)?;
            continue;
        }
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        file.seek(SeekFrom::Start(0))?;
        return Ok(file);
    }
    bail!("Unable to open a secure control lock file: {}", path.display())
}

#[cfg(test)]
#[path = "tests/write_lock_tests.rs"]
mod write_lock_tests;
