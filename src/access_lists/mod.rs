//! Per-group signal and control allow-lists.
//!
//! Layout: `<config_root>/<group>/allowed_signals` and `allowed_controls`,
//! newline-delimited names, `#` comments and blank lines ignored. The
//! `0.DEFAULT_ACCESS` entry applies to every non-root user; its leading
//! digit keeps it from colliding with a real group name.

pub mod accounts;

pub use accounts::{AccountDb, SystemAccounts};

use crate::daemon_log::{daemon_log, service_warning};
use crate::error::{ServiceError, ServiceResult};
use crate::platform_io::PlatformIo;
use crate::secure_files::{secure_make_dirs, secure_make_file, secure_read_file};
use crate::service_paths::{group_dir, CONFIG_ROOT_MODE};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_ACCESS_GROUP: &str = "0.DEFAULT_ACCESS";

const SIGNALS_FILE: &str = "allowed_signals";
const CONTROLS_FILE: &str = "allowed_controls";

/// Effective allow-lists: sorted, duplicate-free signal and control names.
pub type Access = (Vec<String>, Vec<String>);

pub struct AccessLists {
    config_root: PathBuf,
    io: Arc<dyn PlatformIo>,
    accounts: Arc<dyn AccountDb>,
}

impl AccessLists {
    pub fn new(
        config_root: &Path,
        io: Arc<dyn PlatformIo>,
        accounts: Arc<dyn AccountDb>,
    ) -> anyhow::Result<Self> {
        secure_make_dirs(config_root, CONFIG_ROOT_MODE)?;
        Ok(Self {
            config_root: config_root.to_path_buf(),
            io,
            accounts,
        })
    }

    /// Effective access of one group. A group without stored lists has
    /// none; every allowed control is also a readable signal.
    pub fn get_group_access(&self, group: &str) -> ServiceResult<Access> {
        let group = self.validate_group(group)?;
        let (signals, controls) = self.read_group(&group)?;
        Ok(into_access(signals, controls))
    }

    /// Replaces both lists of `group`; the empty name edits the default.
    pub fn set_group_access(
        &self,
        group: &str,
        allowed_signals: &[String],
        allowed_controls: &[String],
    ) -> ServiceResult<()> {
        let group = self.validate_group(group)?;
        self.write_list(&group, SIGNALS_FILE, allowed_signals, &self.io.signal_names())?;
        self.write_list(&group, CONTROLS_FILE, allowed_controls, &self.io.control_names())
    }

    pub fn set_group_access_signals(
        &self,
        group: &str,
        allowed_signals: &[String],
    ) -> ServiceResult<()> {
        let group = self.validate_group(group)?;
        self.write_list(&group, SIGNALS_FILE, allowed_signals, &self.io.signal_names())
    }

    pub fn set_group_access_controls(
        &self,
        group: &str,
        allowed_controls: &[String],
    ) -> ServiceResult<()> {
        let group = self.validate_group(group)?;
        self.write_list(&group, CONTROLS_FILE, allowed_controls, &self.io.control_names())
    }

    /// Effective access of a user: `root` gets everything, the empty name
    /// gets the default entry, anyone else the union of their groups and
    /// the default entry.
    pub fn get_user_access(&self, user: &str) -> ServiceResult<Access> {
        if user == "root" {
            return Ok(self.get_all_access());
        }
        let (mut signals, mut controls) = self.read_group(DEFAULT_ACCESS_GROUP)?;
        if !user.is_empty() {
            let groups = self
                .accounts
                .user_groups(user)
                .map_err(ServiceError::internal)?
                .ok_or_else(|| {
                    ServiceError::invalid(format!("Linux user name is invalid: \"{}\"", user))
                })?;
            for group in groups {
                // Names starting with a digit are reserved for daemon entries.
                if group.starts_with(|c: char| c.is_ascii_digit()) {
                    continue;
                }
                let (group_signals, group_controls) = self.read_group(&group)?;
                signals.extend(group_signals);
                controls.extend(group_controls);
            }
        }
        Ok(into_access(signals, controls))
    }

    /// Every name the platform exposes.
    pub fn get_all_access(&self) -> Access {
        into_access(
            self.io.signal_names().into_iter().collect(),
            self.io.control_names().into_iter().collect(),
        )
    }

    /// Maps the empty name to the default entry and rejects names that
    /// are reserved or unknown to the system.
    fn validate_group(&self, group: &str) -> ServiceResult<String> {
        if group.is_empty() {
            return Ok(DEFAULT_ACCESS_GROUP.to_string());
        }
        if group.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(ServiceError::invalid(format!(
                "Linux group name cannot begin with a digit: group = \"{}\"",
                group
            )));
        }
        let exists = self
            .accounts
            .group_exists(group)
            .map_err(ServiceError::internal)?;
        if !exists {
            return Err(ServiceError::invalid(format!(
                "Linux group name is invalid: \"{}\"",
                group
            )));
        }
        Ok(group.to_string())
    }

    /// Stored lists of a group filtered to names the platform reports.
    fn read_group(&self, group: &str) -> ServiceResult<(BTreeSet<String>, BTreeSet<String>)> {
        let dir = group_dir(&self.config_root, group);
        let signals = self.read_list(&dir.join(SIGNALS_FILE), &self.io.signal_names())?;
        let controls = self.read_list(&dir.join(CONTROLS_FILE), &self.io.control_names())?;
        Ok((signals, controls))
    }

    fn read_list(&self, path: &Path, available: &[String]) -> ServiceResult<BTreeSet<String>> {
        let Some(contents) = secure_read_file(path).map_err(ServiceError::internal)? else {
            return Ok(BTreeSet::new());
        };
        let mut names = BTreeSet::new();
        for name in parse_list(&contents) {
            if available.iter().any(|known| known == name) {
                names.insert(name.to_string());
            } else {
                service_warning(&format!(
                    "Access list {} contains invalid name: \"{}\"",
                    path.display(),
                    name
                ));
            }
        }
        Ok(names)
    }

    fn write_list(
        &self,
        group: &str,
        file: &str,
        names: &[String],
        available: &[String],
    ) -> ServiceResult<()> {
        let unique: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        for name in &unique {
            if !available.iter().any(|known| known == name) {
                service_warning(&format!(
                    "Access list for group \"{}\" will contain a name the platform does \
                     not provide: \"{}\"",
                    group, name
                ));
            }
        }
        let dir = group_dir(&self.config_root, group);
        secure_make_dirs(&dir, CONFIG_ROOT_MODE).map_err(ServiceError::internal)?;
        let mut contents = String::new();
        for name in &unique {
            contents.push_str(name);
            contents.push('\n');
        }
        secure_make_file(&dir.join(file), contents.as_bytes()).map_err(ServiceError::internal)?;
        daemon_log(
            "access_lists",
            &format!("Wrote {} names to {}/{}", unique.len(), group, file),
        );
        Ok(())
    }
}

/// Names in an access list file, skipping blank lines and `#` comments.
pub fn parse_list(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

fn into_access(mut signals: BTreeSet<String>, controls: BTreeSet<String>) -> Access {
    signals.extend(controls.iter().cloned());
    (signals.into_iter().collect(), controls.into_iter().collect())
}

#[cfg(test)]
#[path = "tests/access_lists_tests.rs"]
mod access_lists_tests;
