//! Landlock ruleset built from a path-permission profile.
//!
//! The ruleset is created in the parent, where allocation and logging are
//! fine; the child only calls `restrict_self` before `exec`. Once applied
//! it cannot be lifted.
//!
//! Landlock grants access to file hierarchies, not patterns: a glob rule is
//! granted on the directory holding its first metacharacter, the same
//! prefix the assembler checks against the application roots.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use landlock::{
    ABI, Access, AccessFs, BitFlags, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreated,
    RulesetCreatedAttr, RulesetStatus,
};
use syswarden_common::error::{Result, SyswardenError};
use syswarden_policy::paths::{PathPermissionProfile, PermissionSet, normalize};

/// ABI the ruleset is written against; older kernels get a best-effort
/// subset.
const TARGET_ABI: ABI = ABI::V3;

fn landlock_err(context: &str, e: impl fmt::Display) -> SyswardenError {
    SyswardenError::Landlock {
        message: format!("{context}: {e}"),
    }
}

/// Landlock rights for a permission set.
///
/// `append` maps to plain write access: Landlock has no append-only right,
/// but without `Truncate` existing content cannot be discarded.
#[must_use]
pub fn access_for(perms: PermissionSet, abi: ABI) -> BitFlags<AccessFs> {
    let mut access = BitFlags::empty();
    if perms.read {
        access |= AccessFs::ReadFile | AccessFs::ReadDir;
    }
    if perms.write {
        access |= AccessFs::from_write(abi);
    }
    if perms.execute {
        access |= AccessFs::Execute;
    }
    if perms.append {
        access |= AccessFs::WriteFile;
    }
    access
}

/// A prepared, not yet applied, Landlock ruleset.
pub struct Jail {
    ruleset: Option<RulesetCreated>,
    grants: BTreeMap<PathBuf, BitFlags<AccessFs>>,
}

impl fmt::Debug for Jail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jail")
            .field("armed", &self.ruleset.is_some())
            .field("grants", &self.grants.len())
            .finish()
    }
}

impl Jail {
    /// Prepares a ruleset for `profile`, adding read and execute access to
    /// `runtime` (the executable and what its loader needs).
    ///
    /// An empty profile leaves the filesystem unconfined. Paths that do not
    /// exist are skipped, which only removes access.
    ///
    /// # Errors
    ///
    /// Returns `Landlock` if the ruleset cannot be created.
    pub fn build(profile: &PathPermissionProfile, runtime: &BTreeSet<PathBuf>) -> Result<Self> {
        if profile.is_empty() {
            tracing::warn!("path profile is empty, filesystem access is not confined");
            return Ok(Self {
                ruleset: None,
                grants: BTreeMap::new(),
            });
        }

        let mut wanted: BTreeMap<PathBuf, BitFlags<AccessFs>> = BTreeMap::new();
        for rule in &profile.rules {
            *wanted.entry(normalize(rule.literal_prefix())).or_default() |=
                access_for(rule.permissions, TARGET_ABI);
        }
        for path in runtime {
            *wanted.entry(path.clone()).or_default() |=
                access_for(PermissionSet::READ_EXECUTE, TARGET_ABI);
        }

        let mut ruleset = Ruleset::default()
            .handle_access(AccessFs::from_all(TARGET_ABI))
            .map_err(|e| landlock_err("handling filesystem access", e))?
            .create()
            .map_err(|e| landlock_err("creating ruleset", e))?;
        let mut grants = BTreeMap::new();
        for (path, mut access) in wanted {
            let is_file = std::fs::metadata(&path).is_ok_and(|m| !m.is_dir());
            if is_file {
                access &= AccessFs::from_file(TARGET_ABI);
            }
            if access.is_empty() {
                continue;
            }
            let fd = match PathFd::new(&path) {
                Ok(fd) => fd,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "path rule skipped");
                    continue;
                }
            };
            ruleset = ruleset
                .add_rule(PathBeneath::new(fd, access))
                .map_err(|e| landlock_err(&path.display().to_string(), e))?;
            let _ = grants.insert(path, access);
        }
        tracing::info!(
            rules = profile.rules.len(),
            runtime_paths = runtime.len(),
            grants = grants.len(),
            "prepared landlock ruleset"
        );
        Ok(Self {
            ruleset: Some(ruleset),
            grants,
        })
    }

    /// Returns `true` if applying the jail confines anything.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.ruleset.is_some()
    }

    /// Paths with the rights granted on them.
    #[must_use]
    pub const fn grants(&self) -> &BTreeMap<PathBuf, BitFlags<AccessFs>> {
        &self.grants
    }

    /// Applies the ruleset to the calling thread. Only the first call has an
    /// effect.
    ///
    /// Meant for the child between `fork` and `exec`. Fails if the kernel
    /// does not enforce Landlock at all, so a profile is never silently
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns `EPERM` if the ruleset could not be applied, `EOPNOTSUPP` if
    /// the kernel ignored it.
    pub fn restrict(&mut self) -> std::io::Result<()> {
        let Some(ruleset) = self.ruleset.take() else {
            return Ok(());
        };
        let status = ruleset
            .restrict_self()
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EPERM))?;
        if status.ruleset == RulesetStatus::NotEnforced {
            return Err(std::io::Error::from_raw_os_error(libc::EOPNOTSUPP));
        }
        Ok(())
    }
}
