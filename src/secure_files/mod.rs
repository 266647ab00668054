//! Files and directories with enforced ownership and permissions.
//!
//! Every persistent artifact the daemon owns goes through this module. An
//! artifact that fails a check is never trusted and never deleted: it is
//! renamed aside to `<path>-<uuid>-INVALID` with one warning per failed
//! check, and the caller proceeds as if it were absent.

pub mod umask;

pub use umask::{UmaskGuard, RESTRICTIVE_UMASK};

use crate::daemon_log::service_warning;
use anyhow::{Context, Result};
use nix::libc;
use std::ffi::OsString;
use std::fs::{self, DirBuilder, Metadata, OpenOptions, Permissions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Mode of every file written by [`secure_make_file`].
pub const SECURE_FILE_MODE: u32 = 0o600;

/// Suffix of artifacts that failed validation.
pub const INVALID_SUFFIX: &str = "INVALID";
/// Suffix of session files being torn down.
pub const REMOVE_SUFFIX: &str = "REMOVE";
/// Suffix of in-flight writes.
pub const TMP_SUFFIX: &str = "tmp";

pub fn daemon_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

pub fn daemon_gid() -> u32 {
    nix::unistd::getegid().as_raw()
}

/// Returns `<path>-<uuid>-<suffix>`.
pub fn suffixed_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!("-{}-{}", uuid::Uuid::new_v4(), suffix));
    PathBuf::from(name)
}

/// Renames `path` to `<path>-<uuid>-<suffix>` and returns the new path.
pub fn quarantine(path: &Path, suffix: &str) -> Result<PathBuf> {
    let target = suffixed_path(path, suffix);
    fs::rename(path, &target).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            path.display(),
            target.display()
        )
    })?;
    Ok(target)
}

/// Warns once per problem, then quarantines `path` as invalid.
pub fn quarantine_invalid(path: &Path, problems: &[String]) -> Result<PathBuf> {
    for problem in problems {
        service_warning(&format!("{} {}", path.display(), problem));
    }
    let target = quarantine(path, INVALID_SUFFIX)?;
    service_warning(&format!(
        "{} was moved to {}",
        path.display(),
        target.display()
    ));
    Ok(target)
}

fn ownership_violations(meta: &Metadata, mode: u32) -> Vec<String> {
    let mut problems = Vec::new();
    let actual = meta.mode() & 0o7777;
    if actual != mode {
        problems.push(format!(
            "has wrong permissions: {:#o}, expected {:#o}",
            actual, mode
        ));
    }
    if meta.uid() != daemon_uid() {
        problems.push(format!(
            "has wrong user owner: {}, expected {}",
            meta.uid(),
            daemon_uid()
        ));
    }
    if meta.gid() != daemon_gid() {
        problems.push(format!(
            "has wrong group owner: {}, expected {}",
            meta.gid(),
            daemon_gid()
        ));
    }
    problems
}

/// Checks lstat metadata of a directory that should have exactly `mode`.
pub fn dir_violations(meta: &Metadata, mode: u32) -> Vec<String> {
    if meta.file_type().is_symlink() {
        return vec!["is a symbolic link".to_string()];
    }
    if !meta.is_dir() {
        return vec!["is not a directory".to_string()];
    }
    ownership_violations(meta, mode)
}

/// Checks fstat metadata of an opened file: regular, 0o600, daemon owned.
pub fn file_violations(meta: &Metadata) -> Vec<String> {
    if !meta.file_type().is_file() {
        return vec!["is not a regular file".to_string()];
    }
    ownership_violations(meta, SECURE_FILE_MODE)
}

/// Ensures `path` is a directory owned by the daemon with exactly `mode`.
///
/// An existing artifact that fails any check is quarantined and replaced.
/// Missing parents are created with the same mode.
pub fn secure_make_dirs(path: &Path, mode: u32) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            let problems = dir_violations(&meta, mode);
            if problems.is_empty() {
                return Ok(());
            }
            quarantine_invalid(path, &problems)?;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to stat {}", path.display()));
        }
    }

    let _umask = UmaskGuard::for_mode(mode);
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .with_context(|| format!("Failed to create directory {}", path.display()))?;
    fs::set_permissions(path, Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

/// Atomically replaces `path` with `contents`, mode 0o600.
///
/// The data is written to `<path>-<uuid>-tmp` first and renamed over
/// `path`; the temporary file is removed if any step fails.
pub fn secure_make_file(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = suffixed_path(path, TMP_SUFFIX);
    let result = write_new_file(&tmp, contents).and_then(|()| {
        fs::rename(&tmp, path).with_context(|| {
            format!("Failed to rename {} to {}", tmp.display(), path.display())
        })
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_new_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = {
        let _umask = UmaskGuard::set(RESTRICTIVE_UMASK);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(SECURE_FILE_MODE)
            .custom_flags(libc::O_NOFOLLOW)
            .open(path)
            .with_context(|| format!("Failed to create {}", path.display()))?
    };
    file.write_all(contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {}", path.display()))?;
    Ok(())
}

/// Returns the contents of `path` if it is a trusted daemon file.
///
/// Missing files yield `None` silently. Symlinks, special files, wrong
/// ownership or permissions and non-UTF-8 contents are quarantined and
/// yield `None`.
pub fn secure_read_file(path: &Path) -> Result<Option<String>> {
    Ok(secure_read(path)?.map(|(contents, _)| contents))
}

/// Like [`secure_read_file`], also returning the fstat metadata of the
/// descriptor the contents were read from.
pub fn secure_read(path: &Path) -> Result<Option<(String, Metadata)>> {
    let mut file = match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) if e.raw_os_error() == Some(libc::ELOOP) => {
            quarantine_invalid(path, &["is a symbolic link".to_string()])?;
            return Ok(None);
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
        return Ok(None);
    }

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match String::from_utf8(bytes) {
        Ok(contents) => Ok(Some((contents, meta))),
        Err(_) => {
            quarantine_invalid(path, &["does not contain UTF-8 text".to_string()])?;
            Ok(None)
        }
    }
}

/// Unlinks `path`; returns false if it was already gone.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
#[path = "tests/secure_files_tests.rs"]
mod secure_files_tests;
