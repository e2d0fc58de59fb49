//! Elimination testing of filter profiles.
//!
//! Each non-baseline syscall is removed in turn and a [`WorkloadProbe`]
//! checks whether the target still starts and serves its workload under the
//! reduced profile. Removals that pass are kept, so later candidates are
//! tested against an already reduced profile.

use serde::Serialize;
use syswarden_common::error::Result;
use syswarden_common::types::{Provenance, SyscallName};

use crate::filter::FilterProfile;

/// Result of running the workload under a candidate profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "kebab-case")]
pub enum ProbeOutcome {
    /// The target started and the workload succeeded.
    Passed,
    /// The target did not start or died during startup.
    StartupFailed(String),
    /// The target started but the workload failed.
    WorkloadFailed(String),
}

impl ProbeOutcome {
    /// Returns `true` for [`ProbeOutcome::Passed`].
    #[must_use]
    pub const fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Runs a workload under a candidate profile.
pub trait WorkloadProbe {
    /// Runs the workload confined by `candidate`.
    ///
    /// # Errors
    ///
    /// Returns an error only when probing itself is impossible (e.g. the
    /// bundle cannot be written). Failures of the target are reported as a
    /// [`ProbeOutcome`].
    fn probe(&mut self, candidate: &FilterProfile) -> Result<ProbeOutcome>;
}

impl<F> WorkloadProbe for F
where
    F: FnMut(&FilterProfile) -> Result<ProbeOutcome>,
{
    fn probe(&mut self, candidate: &FilterProfile) -> Result<ProbeOutcome> {
        self(candidate)
    }
}

/// A syscall that could not be removed, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Necessity {
    /// The syscall.
    pub syscall: SyscallName,
    /// Probe result without it.
    pub outcome: ProbeOutcome,
}

/// Outcome of a minimization pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MinimizationReport {
    /// Version of the input profile.
    pub from_version: u32,
    /// Syscalls the workload needs.
    pub necessary: Vec<Necessity>,
    /// Syscalls removed from the profile.
    pub removed: Vec<SyscallName>,
    /// Number of probe runs.
    pub probes: usize,
}

/// Minimizes `profile` against `probe`.
///
/// Baseline rules are never candidates. The returned profile carries
/// `profile.version() + 1`.
///
/// # Errors
///
/// Propagates probe errors.
pub fn minimize(
    profile: &FilterProfile,
    probe: &mut dyn WorkloadProbe,
) -> Result<(FilterProfile, MinimizationReport)> {
    let candidates: Vec<SyscallName> = profile
        .rules()
        .iter()
        .filter(|r| r.provenance == Provenance::Observed)
        .map(|r| r.syscall.clone())
        .collect();
    tracing::info!(
        version = profile.version(),
        candidates = candidates.len(),
        "starting elimination testing"
    );

    let mut working = profile.clone();
    let mut report = MinimizationReport {
        from_version: profile.version(),
        necessary: Vec::new(),
        removed: Vec::new(),
        probes: 0,
    };

    for (i, syscall) in candidates.into_iter().enumerate() {
        let candidate = working.without(&syscall);
        let outcome = probe.probe(&candidate)?;
        report.probes += 1;
        tracing::debug!(step = i + 1, %syscall, ?outcome, "probe finished");
        if outcome.passed() {
            tracing::info!(%syscall, "removable");
            working = candidate;
            report.removed.push(syscall);
        } else {
            tracing::info!(%syscall, ?outcome, "necessary");
            report.necessary.push(Necessity { syscall, outcome });
        }
    }

    let minimized = working.with_version(profile.version().saturating_add(1));
    tracing::info!(
        version = minimized.version(),
        necessary = report.necessary.len(),
        removed = report.removed.len(),
        "elimination testing finished"
    );
    Ok((minimized, report))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::filter::{DefaultAction, FilterRule};

    fn rule(name: &str, provenance: Provenance) -> FilterRule {
        FilterRule {
            syscall: SyscallName::new(name).unwrap(),
            provenance,
        }
    }

    fn profile() -> FilterProfile {
        FilterProfile::new(
            DefaultAction::KillProcess,
            Vec::new(),
            vec![
                rule("accept", Provenance::Observed),
                rule("brk", Provenance::Baseline),
                rule("ptrace", Provenance::Observed),
                rule("sendto", Provenance::Observed),
            ],
            2,
        )
        .unwrap()
    }

    #[test]
    fn keeps_only_what_the_workload_needs() {
        let needed: BTreeSet<&str> = ["accept", "sendto"].into();
        let mut seen_baseline_removal = false;
        let mut probe = |p: &FilterProfile| -> Result<ProbeOutcome> {
            if !p.allows(&SyscallName::new("brk").unwrap()) {
                seen_baseline_removal = true;
            }
            let missing = needed
                .iter()
                .find(|n| !p.allows(&SyscallName::new(**n).unwrap()));
            Ok(match missing {
                Some(&"accept") => ProbeOutcome::StartupFailed("killed by SIGSYS".into()),
                Some(n) => ProbeOutcome::WorkloadFailed(format!("{n} missing")),
                None => ProbeOutcome::Passed,
            })
        };

        let (min, report) = minimize(&profile(), &mut probe).unwrap();
        assert!(!seen_baseline_removal);
        assert_eq!(report.probes, 3);
        assert_eq!(report.removed, [SyscallName::new("ptrace").unwrap()]);
        assert_eq!(report.necessary.len(), 2);
        assert!(matches!(
            report.necessary[0].outcome,
            ProbeOutcome::StartupFailed(_)
        ));
        assert_eq!(min.version(), 3);
        assert_eq!(min.rules().len(), 3);
    }

    #[test]
    fn probe_errors_abort_minimization() {
        let mut probe = |_: &FilterProfile| -> Result<ProbeOutcome> {
            Err(syswarden_common::error::SyswardenError::Process {
                message: "cannot start".into(),
            })
        };
        assert!(minimize(&profile(), &mut probe).is_err());
    }
}
