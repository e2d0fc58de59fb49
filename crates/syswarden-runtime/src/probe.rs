//! Workload probe that launches the real target.
//!
//! Each candidate profile is assembled into a throwaway bundle, the target
//! is started under it, given time to come up, and driven by a scenario.
//! Probe launches never write to the violation log: kills here are the
//! expected result of removing a needed syscall.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use syswarden_common::error::{Result, SyswardenError};
use syswarden_common::types::TargetIdentity;
use syswarden_policy::bundle::assemble;
use syswarden_policy::paths::PathPermissionProfile;
use syswarden_profile::filter::FilterProfile;
use syswarden_profile::minimize::{ProbeOutcome, WorkloadProbe};
use syswarden_trace::scenario::ScenarioDriver;

use crate::launcher::{Launcher, StdioMode};
use crate::monitor::ExitOutcome;
use crate::violations::ViolationRecord;

/// Default time a target gets to start before the workload is driven.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Probes candidate profiles by launching the target under them.
pub struct LaunchProbe {
    launcher: Launcher,
    paths: PathPermissionProfile,
    target: TargetIdentity,
    app_roots: Vec<PathBuf>,
    args: Vec<String>,
    scenario: Arc<dyn ScenarioDriver>,
    startup_grace: Duration,
}

impl std::fmt::Debug for LaunchProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchProbe")
            .field("target", &self.target)
            .field("scenario", &self.scenario.name())
            .field("startup_grace", &self.startup_grace)
            .finish_non_exhaustive()
    }
}

impl LaunchProbe {
    /// Creates a probe for `target`, run with `args` and exercised by
    /// `scenario`.
    ///
    /// `paths` and `app_roots` are the same ones the real bundle is
    /// assembled with.
    #[must_use]
    pub fn new(
        launcher: Launcher,
        target: TargetIdentity,
        args: Vec<String>,
        paths: PathPermissionProfile,
        app_roots: Vec<PathBuf>,
        scenario: Arc<dyn ScenarioDriver>,
    ) -> Self {
        Self {
            launcher: launcher
                .with_violation_log(None)
                .with_stdio(StdioMode::Null),
            paths,
            target,
            app_roots,
            args,
            scenario,
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }

    /// Sets how long the target gets to start.
    #[must_use]
    pub const fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }
}

impl WorkloadProbe for LaunchProbe {
    fn probe(&mut self, candidate: &FilterProfile) -> Result<ProbeOutcome> {
        let bundle = assemble(candidate, &self.paths, self.target.clone(), &self.app_roots)?;
        let process = match self
            .launcher
            .launch(&bundle, &self.target.executable, &self.args)
        {
            Ok(p) => p,
            Err(e @ SyswardenError::Process { .. }) => {
                return Ok(ProbeOutcome::StartupFailed(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        std::thread::sleep(self.startup_grace);
        if process.has_exited() {
            let (outcome, killed) = process.finish()?;
            tracing::debug!(
                version = candidate.version(),
                %outcome,
                workers_killed = killed.len(),
                "target exited during startup"
            );
            return Ok(match (outcome, killed.first()) {
                (ExitOutcome::Exited(0), None) => ProbeOutcome::Passed,
                (ExitOutcome::Exited(0), Some(worker)) => {
                    ProbeOutcome::StartupFailed(worker_killed(worker))
                }
                (other, _) => ProbeOutcome::StartupFailed(other.to_string()),
            });
        }

        let driven = self.scenario.drive(process.pid());
        let running = !process.has_exited();
        if running {
            process.terminate()?;
        }
        let (outcome, killed) = process.finish()?;
        let verdict = judge(running, &outcome, &killed, driven);
        tracing::debug!(version = candidate.version(), %outcome, ?verdict, "probe finished");
        Ok(verdict)
    }
}

/// Verdict for a target that survived startup.
///
/// `running` says whether it was still up when the workload finished, in
/// which case the launcher stopped it and its exit status is not held
/// against it, unless that was a policy kill. A worker killed by the policy
/// fails the candidate too.
fn judge(
    running: bool,
    outcome: &ExitOutcome,
    killed: &[ViolationRecord],
    driven: Result<()>,
) -> ProbeOutcome {
    if let Err(e) = driven {
        return ProbeOutcome::WorkloadFailed(e.to_string());
    }
    match outcome {
        ExitOutcome::PolicyViolation(_) => ProbeOutcome::WorkloadFailed(outcome.to_string()),
        _ if !killed.is_empty() => ProbeOutcome::WorkloadFailed(worker_killed(&killed[0])),
        _ if running => ProbeOutcome::Passed,
        ExitOutcome::Exited(0) => ProbeOutcome::Passed,
        other => ProbeOutcome::WorkloadFailed(other.to_string()),
    }
}

fn worker_killed(record: &ViolationRecord) -> String {
    format!(
        "worker {} killed by seccomp policy on {}",
        record.pid,
        record.syscall_label()
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use syswarden_common::types::Sha256Hash;

    use super::*;

    fn record(pid: u32) -> ViolationRecord {
        ViolationRecord {
            checksum: Sha256Hash::from_hex("d".repeat(64)).unwrap(),
            syscall: None,
            syscall_nr: Some(42),
            pid,
            timestamp: Utc::now(),
        }
    }

    fn kill() -> ExitOutcome {
        ExitOutcome::PolicyViolation(record(9))
    }

    #[test]
    fn stopped_service_passes() {
        assert_eq!(judge(true, &ExitOutcome::Signaled(15), &[], Ok(())), ProbeOutcome::Passed);
        assert_eq!(judge(true, &ExitOutcome::Exited(143), &[], Ok(())), ProbeOutcome::Passed);
    }

    #[test]
    fn policy_kill_fails_even_when_stopped() {
        assert!(!judge(true, &kill(), &[record(9)], Ok(())).passed());
        assert!(!judge(false, &kill(), &[record(9)], Ok(())).passed());
    }

    #[test]
    fn early_exit_must_be_clean() {
        assert!(judge(false, &ExitOutcome::Exited(0), &[], Ok(())).passed());
        assert!(matches!(
            judge(false, &ExitOutcome::Exited(1), &[], Ok(())),
            ProbeOutcome::WorkloadFailed(_)
        ));
    }

    #[test]
    fn killed_worker_fails_a_clean_exit() {
        let verdict = judge(false, &ExitOutcome::Exited(0), &[record(12)], Ok(()));
        assert!(matches!(verdict, ProbeOutcome::WorkloadFailed(m) if m.contains("worker 12")));
        assert!(!judge(true, &ExitOutcome::Signaled(15), &[record(12)], Ok(())).passed());
    }

    #[test]
    fn scenario_failure_wins() {
        let failed = Err(SyswardenError::Scenario {
            scenario: "http".into(),
            message: "GET / returned 500".into(),
        });
        let verdict = judge(true, &ExitOutcome::Signaled(15), &[], failed);
        assert!(matches!(verdict, ProbeOutcome::WorkloadFailed(m) if m.contains("500")));
    }
}
