//! Unix account database lookups used for group validation and user access.

use anyhow::{Context, Result};
use nix::unistd::{getgrouplist, Group, User};
use std::ffi::CString;

pub trait AccountDb: Send + Sync {
    fn group_exists(&self, group: &str) -> Result<bool>;

    /// Names of every group `user` belongs to, primary group included.
    /// `None` if the user does not exist.
    fn user_groups(&self, user: &str) -> Result<Option<Vec<String>>>;

    /// Login name of a uid, used to attribute RPC callers.
    fn user_name(&self, uid: u32) -> Result<Option<String>>;
}

/// passwd/group database backed accounts.
pub struct SystemAccounts;

impl AccountDb for SystemAccounts {
    fn group_exists(&self, group: &str) -> Result<bool> {
        let found = Group::from_name(group)
            .with_context(|| format!("Failed to look up group {}", group))?;
        Ok(found.is_some())
    }

    fn user_groups(&self, user: &str) -> Result<Option<Vec<String>>> {
        let Some(entry) = User::from_name(user)
            .with_context(|| format!("Failed to look up user {}", user))?
        else {
            return Ok(None);
        };
        let c_user = CString::new(user).context("User name contains a NUL byte")?;
        let gids = getgrouplist(&c_user, entry.gid)
            .with_context(|| format!("Failed to list groups of {}", user))?;
        let mut names = Vec::with_capacity(gids.len());
        for gid in gids {
            if let Some(group) = Group::from_gid(gid)
                .with_context(|| format!("Failed to look up gid {}", gid))?
            {
                names.push(group.name);
            }
        }
        Ok(Some(names))
    }

    fn user_name(&self, uid: u32) -> Result<Option<String>> {
        let entry = User::from_uid(nix::unistd::Uid::from_raw(uid))
            .with_context(|| format!("Failed to look up uid {}", uid))?;
        Ok(entry.map(|user| user.name))
    }
}
