//! Syscall usage sets.
//!
//! A [`SyscallUsageSet`] maps each syscall name to where it came from. It only
//! grows: merging is a set union where `observed` provenance dominates
//! `baseline`, so merges are commutative, associative and idempotent.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use syswarden_common::error::{Result, SyswardenError};
use syswarden_common::types::{Provenance, SyscallName};
use syswarden_trace::event::{SyscallEvent, TraceRecording};

use crate::baseline;

/// Ordered map of syscall name to provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyscallUsageSet {
    entries: BTreeMap<SyscallName, Provenance>,
}

impl SyscallUsageSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding the startup/teardown baseline.
    #[must_use]
    pub fn with_baseline() -> Self {
        let mut set = Self::new();
        for name in baseline::baseline() {
            let _ = set.insert(name, Provenance::Baseline);
        }
        set
    }

    /// Adds a syscall, joining provenance with any existing entry.
    ///
    /// Returns `true` if the name was not present before.
    pub fn insert(&mut self, name: SyscallName, provenance: Provenance) -> bool {
        match self.entries.get_mut(&name) {
            Some(existing) => {
                *existing = existing.join(provenance);
                false
            }
            None => {
                let _ = self.entries.insert(name, provenance);
                true
            }
        }
    }

    /// Merges `other` into `self` and returns the names that were new.
    pub fn absorb(&mut self, other: &Self) -> Vec<SyscallName> {
        other
            .iter()
            .filter(|&(name, prov)| self.insert(name.clone(), prov))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Returns `true` if `name` is in the set.
    #[must_use]
    pub fn contains(&self, name: &SyscallName) -> bool {
        self.entries.contains_key(name)
    }

    /// Provenance of `name`, if present.
    #[must_use]
    pub fn provenance(&self, name: &SyscallName) -> Option<Provenance> {
        self.entries.get(name).copied()
    }

    /// Number of syscalls in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of syscalls with `observed` provenance.
    #[must_use]
    pub fn observed_count(&self) -> usize {
        self.entries
            .values()
            .filter(|p| **p == Provenance::Observed)
            .count()
    }

    /// Iterates in syscall-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&SyscallName, Provenance)> {
        self.entries.iter().map(|(n, p)| (n, *p))
    }

    /// Iterates over the names in order.
    pub fn names(&self) -> impl Iterator<Item = &SyscallName> {
        self.entries.keys()
    }

    /// Returns `true` if every name in `self` is also in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.entries.keys().all(|n| other.contains(n))
    }

    /// Loads a usage set from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| SyswardenError::io(path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Writes the set to `path` as pretty JSON, replacing the file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| SyswardenError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| SyswardenError::io(path, e))
    }
}

impl FromIterator<(SyscallName, Provenance)> for SyscallUsageSet {
    fn from_iter<I: IntoIterator<Item = (SyscallName, Provenance)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (name, prov) in iter {
            let _ = set.insert(name, prov);
        }
        set
    }
}

/// Anything that can be viewed as a usage set: recordings, raw event
/// streams, or other sets.
pub trait UsageSource {
    /// Returns the syscalls this source contributes.
    fn usage(&self) -> SyscallUsageSet;
}

impl UsageSource for SyscallUsageSet {
    fn usage(&self) -> SyscallUsageSet {
        self.clone()
    }
}

impl UsageSource for TraceRecording {
    fn usage(&self) -> SyscallUsageSet {
        observed(self.events())
    }
}

impl UsageSource for [SyscallEvent] {
    fn usage(&self) -> SyscallUsageSet {
        observed(self.iter())
    }
}

fn observed<'a>(events: impl Iterator<Item = &'a SyscallEvent>) -> SyscallUsageSet {
    events
        .map(|e| (e.syscall.clone(), Provenance::Observed))
        .collect()
}

/// Returns `existing ∪ source`, joining provenance.
#[must_use]
pub fn merge<S: UsageSource + ?Sized>(source: &S, existing: &SyscallUsageSet) -> SyscallUsageSet {
    let mut merged = existing.clone();
    let _ = merged.absorb(&source.usage());
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(observed: &[&str], baseline: &[&str]) -> SyscallUsageSet {
        observed
            .iter()
            .map(|n| (SyscallName::new(*n).unwrap(), Provenance::Observed))
            .chain(
                baseline
                    .iter()
                    .map(|n| (SyscallName::new(*n).unwrap(), Provenance::Baseline)),
            )
            .collect()
    }

    #[test]
    fn merge_is_commutative_and_idempotent() {
        let a = set(&["read", "write"], &["brk"]);
        let b = set(&["brk", "accept"], &["read"]);

        let ab = merge(&a, &b);
        let ba = merge(&b, &a);
        assert_eq!(ab, ba);
        assert_eq!(merge(&ab, &ab), ab);
        assert_eq!(
            ab.provenance(&SyscallName::new("brk").unwrap()),
            Some(Provenance::Observed)
        );
    }

    #[test]
    fn merge_is_associative() {
        let a = set(&["read"], &[]);
        let b = set(&[], &["read", "mmap"]);
        let c = set(&["close"], &["mmap"]);
        assert_eq!(merge(&merge(&a, &b), &c), merge(&a, &merge(&b, &c)));
    }

    #[test]
    fn absorb_reports_only_new_names() {
        let mut a = set(&["read"], &[]);
        let new = a.absorb(&set(&["read", "write"], &[]));
        assert_eq!(new, [SyscallName::new("write").unwrap()]);
        assert!(a.absorb(&set(&["write"], &[])).is_empty());
    }

    #[test]
    fn baseline_set_has_no_observed_entries() {
        let s = SyscallUsageSet::with_baseline();
        assert!(!s.is_empty());
        assert_eq!(s.observed_count(), 0);
    }

    #[test]
    fn save_and_load_preserve_provenance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("usage.json");
        let s = set(&["accept"], &["brk"]);
        s.save(&path).expect("save");

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"accept\": \"observed\""));
        assert_eq!(SyscallUsageSet::load(&path).expect("load"), s);
    }
}
