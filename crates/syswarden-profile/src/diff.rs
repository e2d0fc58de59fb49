//! Differences between two filter profile versions.

use std::fmt;

use serde::Serialize;
use syswarden_common::types::SyscallName;

use crate::filter::FilterProfile;

/// What changed between two profiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileDiff {
    /// Version of the older profile.
    pub from_version: u32,
    /// Version of the newer profile.
    pub to_version: u32,
    /// Syscalls allowed only by the newer profile.
    pub added: Vec<SyscallName>,
    /// Syscalls allowed only by the older profile.
    pub removed: Vec<SyscallName>,
    /// Default action change, as `(old, new)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_action: Option<(String, String)>,
}

impl ProfileDiff {
    /// Returns `true` if the profiles allow the same syscalls under the same
    /// default action.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.default_action.is_none()
    }
}

/// Compares `old` against `new`.
#[must_use]
pub fn diff(old: &FilterProfile, new: &FilterProfile) -> ProfileDiff {
    let before = old.allowlist();
    let after = new.allowlist();
    ProfileDiff {
        from_version: old.version(),
        to_version: new.version(),
        added: after.difference(&before).cloned().collect(),
        removed: before.difference(&after).cloned().collect(),
        default_action: (old.default_action() != new.default_action()).then(|| {
            (
                old.default_action().to_string(),
                new.default_action().to_string(),
            )
        }),
    }
}

impl fmt::Display for ProfileDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "v{} -> v{}", self.from_version, self.to_version)?;
        if let Some((old, new)) = &self.default_action {
            writeln!(f, "  default action: {old} -> {new}")?;
        }
        for name in &self.added {
            writeln!(f, "  + {name}")?;
        }
        for name in &self.removed {
            writeln!(f, "  - {name}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use syswarden_common::types::Provenance;

    use super::*;
    use crate::filter::{DefaultAction, FilterRule};

    fn profile(action: DefaultAction, names: &[&str], version: u32) -> FilterProfile {
        let rules = names.iter().map(|n| FilterRule {
            syscall: SyscallName::new(*n).unwrap(),
            provenance: Provenance::Observed,
        });
        FilterProfile::new(action, Vec::new(), rules, version).unwrap()
    }

    #[test]
    fn reports_added_and_removed() {
        let old = profile(DefaultAction::KillProcess, &["read", "write", "ptrace"], 1);
        let new = profile(DefaultAction::KillProcess, &["read", "write", "accept"], 2);
        let d = diff(&old, &new);

        assert_eq!(d.added, [SyscallName::new("accept").unwrap()]);
        assert_eq!(d.removed, [SyscallName::new("ptrace").unwrap()]);
        assert!(d.default_action.is_none());
        assert_eq!(d.to_string(), "v1 -> v2\n  + accept\n  - ptrace\n");
    }

    #[test]
    fn identical_profiles_have_empty_diff() {
        let p = profile(DefaultAction::Log, &["read"], 4);
        assert!(diff(&p, &p).is_empty());
    }

    #[test]
    fn default_action_change_is_reported() {
        let old = profile(DefaultAction::Log, &["read"], 1);
        let new = profile(DefaultAction::KillProcess, &["read"], 2);
        let d = diff(&old, &new);
        assert_eq!(
            d.default_action,
            Some(("log".to_string(), "kill-process".to_string()))
        );
        assert!(!d.is_empty());
    }
}
