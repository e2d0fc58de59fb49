//! Per-target aggregation of trace runs.
//!
//! The [`Aggregator`] owns a running [`SyscallUsageSet`] seeded with the
//! baseline. Each ingested run adds to it and records a coverage delta: the
//! share of the running total that the run discovered. The delta is reported
//! only; deciding when coverage is sufficient is up to the operator.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use syswarden_common::error::{Result, SyswardenError};
use syswarden_common::types::{Provenance, SyscallName};

use crate::usage::{SyscallUsageSet, UsageSource};

/// Coverage statistics for one ingested run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCoverage {
    /// 1-based position of the run in the history.
    pub run: usize,
    /// Free-form label, usually the session id or recording file.
    pub label: String,
    /// Syscalls this run added to the running set.
    pub discovered: Vec<SyscallName>,
    /// Size of the running set after the run.
    pub total: usize,
    /// `discovered / total`; 0.0 when nothing was new.
    pub delta: f64,
}

/// Running usage set for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregator {
    target: String,
    usage: SyscallUsageSet,
    #[serde(default)]
    runs: Vec<RunCoverage>,
    #[serde(default)]
    hints: BTreeSet<SyscallName>,
}

impl Aggregator {
    /// Creates an aggregator for `target`, seeded with the baseline.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self::from_usage(target, SyscallUsageSet::with_baseline())
    }

    /// Creates an aggregator continuing from an existing usage set.
    #[must_use]
    pub fn from_usage(target: impl Into<String>, usage: SyscallUsageSet) -> Self {
        Self {
            target: target.into(),
            usage,
            runs: Vec::new(),
            hints: BTreeSet::new(),
        }
    }

    /// Target this aggregator collects usage for.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Merges one run into the running set and records its coverage.
    pub fn ingest<S: UsageSource + ?Sized>(
        &mut self,
        label: impl Into<String>,
        source: &S,
    ) -> &RunCoverage {
        let discovered = self.usage.absorb(&source.usage());
        let total = self.usage.len();
        #[allow(clippy::cast_precision_loss)]
        let delta = if discovered.is_empty() || total == 0 {
            0.0
        } else {
            discovered.len() as f64 / total as f64
        };
        let coverage = RunCoverage {
            run: self.runs.len() + 1,
            label: label.into(),
            discovered,
            total,
            delta,
        };
        tracing::info!(
            target = %self.target,
            run = coverage.run,
            label = %coverage.label,
            discovered = coverage.discovered.len(),
            total,
            delta,
            "merged trace run"
        );
        self.runs.push(coverage);
        &self.runs[self.runs.len() - 1]
    }

    /// Coverage delta of the latest run, if any run was ingested.
    #[must_use]
    pub fn coverage_delta(&self) -> Option<f64> {
        self.runs.last().map(|r| r.delta)
    }

    /// Run history, oldest first.
    #[must_use]
    pub fn runs(&self) -> &[RunCoverage] {
        &self.runs
    }

    /// Current running set.
    #[must_use]
    pub const fn usage(&self) -> &SyscallUsageSet {
        &self.usage
    }

    /// Records a syscall that a confined process was killed for.
    ///
    /// The syscall is kept as a pending hint and does not widen the usage
    /// set until [`accept_hint`](Self::accept_hint) is called.
    pub fn ingest_violation(&mut self, syscall: SyscallName) {
        if self.usage.contains(&syscall) {
            tracing::debug!(%syscall, "violation hint already covered by usage set");
            return;
        }
        if self.hints.insert(syscall.clone()) {
            tracing::warn!(target = %self.target, %syscall, "pending violation hint");
        }
    }

    /// Pending hints, in name order.
    #[must_use]
    pub const fn hints(&self) -> &BTreeSet<SyscallName> {
        &self.hints
    }

    /// Promotes a pending hint into the usage set as `observed`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `syscall` is not a pending hint.
    pub fn accept_hint(&mut self, syscall: &SyscallName) -> Result<()> {
        if !self.hints.remove(syscall) {
            return Err(SyswardenError::NotFound {
                kind: "violation hint",
                id: syscall.to_string(),
            });
        }
        let _ = self.usage.insert(syscall.clone(), Provenance::Observed);
        tracing::info!(target = %self.target, %syscall, "accepted violation hint");
        Ok(())
    }

    /// Consumes the aggregator and returns the frozen usage set.
    #[must_use]
    pub fn freeze(self) -> SyscallUsageSet {
        self.usage
    }

    /// Loads aggregator state from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| SyswardenError::io(path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Writes aggregator state to `path`, replacing it atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| SyswardenError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| SyswardenError::io(path, e))
    }
}

/// An [`Aggregator`] shared between concurrent trace sessions.
#[derive(Debug, Clone)]
pub struct SharedAggregator(Arc<Mutex<Aggregator>>);

impl SharedAggregator {
    /// Wraps an aggregator for shared use.
    #[must_use]
    pub fn new(aggregator: Aggregator) -> Self {
        Self(Arc::new(Mutex::new(aggregator)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Aggregator>> {
        self.0.lock().map_err(|_| SyswardenError::Process {
            message: "aggregator lock poisoned".into(),
        })
    }

    /// Merges one run; see [`Aggregator::ingest`].
    ///
    /// # Errors
    ///
    /// Returns an error if another thread panicked while holding the lock.
    pub fn ingest<S: UsageSource + ?Sized>(
        &self,
        label: impl Into<String>,
        source: &S,
    ) -> Result<RunCoverage> {
        Ok(self.lock()?.ingest(label, source).clone())
    }

    /// Returns a copy of the current running set.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<SyscallUsageSet> {
        Ok(self.lock()?.usage().clone())
    }

    /// Returns the inner aggregator once no other handle is alive, or a
    /// clone of it otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn into_inner(self) -> Result<Aggregator> {
        match Arc::try_unwrap(self.0) {
            Ok(mutex) => mutex.into_inner().map_err(|_| SyswardenError::Process {
                message: "aggregator lock poisoned".into(),
            }),
            Err(shared) => Self(shared).lock().map(|a| a.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(names: &[&str]) -> SyscallUsageSet {
        names
            .iter()
            .map(|n| (SyscallName::new(*n).unwrap(), Provenance::Observed))
            .collect()
    }

    #[test]
    fn new_aggregator_is_seeded_with_baseline() {
        let agg = Aggregator::new("web");
        assert_eq!(agg.usage(), &SyscallUsageSet::with_baseline());
        assert!(agg.coverage_delta().is_none());
    }

    #[test]
    fn repeated_run_has_zero_delta() {
        let mut agg = Aggregator::from_usage("web", SyscallUsageSet::new());
        let run = observed(&["accept", "read", "write", "close"]);

        let first = agg.ingest("run-1", &run).clone();
        assert!((first.delta - 1.0).abs() < f64::EPSILON);
        assert_eq!(first.total, 4);

        let second = agg.ingest("run-2", &run);
        assert!(second.discovered.is_empty());
        assert!(second.delta.abs() < f64::EPSILON);
        assert_eq!(agg.runs().len(), 2);
    }

    #[test]
    fn delta_is_share_of_running_total() {
        let mut agg = Aggregator::from_usage("web", observed(&["read", "write", "close"]));
        let run = agg.ingest("run", &observed(&["read", "accept"])).clone();
        assert_eq!(run.discovered, [SyscallName::new("accept").unwrap()]);
        assert!((run.delta - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn hints_need_explicit_acceptance() {
        let mut agg = Aggregator::new("web");
        let ptrace = SyscallName::new("ptrace").unwrap();
        agg.ingest_violation(ptrace.clone());

        assert!(agg.hints().contains(&ptrace));
        assert!(!agg.usage().contains(&ptrace));

        agg.accept_hint(&ptrace).unwrap();
        assert!(agg.hints().is_empty());
        assert_eq!(agg.usage().provenance(&ptrace), Some(Provenance::Observed));
    }

    #[test]
    fn accepting_unknown_hint_fails() {
        let mut agg = Aggregator::new("web");
        let err = agg
            .accept_hint(&SyscallName::new("mount").unwrap())
            .unwrap_err();
        assert!(matches!(err, SyswardenError::NotFound { .. }));
    }

    #[test]
    fn shared_aggregator_merges_from_threads() {
        let shared = SharedAggregator::new(Aggregator::from_usage("web", SyscallUsageSet::new()));
        let handles: Vec<_> = [["read", "write"], ["accept", "read"], ["close", "write"]]
            .into_iter()
            .enumerate()
            .map(|(i, names)| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    let _ = shared.ingest(format!("run-{i}"), &observed(&names)).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let usage = shared.snapshot().unwrap();
        assert_eq!(usage, observed(&["accept", "close", "read", "write"]));
        assert_eq!(shared.into_inner().unwrap().runs().len(), 3);
    }

    #[test]
    fn state_round_trips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("aggregate.json");
        let mut agg = Aggregator::new("web");
        let _ = agg.ingest("run-1", &observed(&["accept"]));
        agg.ingest_violation(SyscallName::new("ptrace").unwrap());
        agg.save(&path).expect("save");

        let loaded = Aggregator::load(&path).expect("load");
        assert_eq!(loaded.usage(), agg.usage());
        assert_eq!(loaded.hints(), agg.hints());
        assert_eq!(loaded.runs().len(), 1);
    }
}
