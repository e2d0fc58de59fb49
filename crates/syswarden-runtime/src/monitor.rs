//! Exit classification and the per-launch monitor thread.
//!
//! The monitor owns the [`Child`] and polls it from its own thread, so the
//! supervised process is never held up by supervision. Between polls it
//! records the process tree and reads the audit trail: a worker killed by
//! the filter yields a [`ViolationRecord`] even when the root keeps running
//! or exits cleanly. When the root itself dies of `SIGSYS` under a
//! kill-process filter, the audit trail is searched for its syscall. Every
//! killed pid is reported exactly once on the channel.

use std::collections::BTreeSet;
use std::fmt;
use std::os::unix::process::ExitStatusExt as _;
use std::process::{Child, ExitStatus};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use syswarden_common::config::LaunchConfig;
use syswarden_common::error::{Result, SyswardenError};
use syswarden_common::types::Sha256Hash;
use syswarden_profile::filter::DefaultAction;
use syswarden_trace::resolve::SyscallResolver;

use crate::audit::{AuditRecord, AuditWatch};
use crate::tree::ProcessTree;
use crate::violations::{ViolationLog, ViolationRecord};

/// Signal the kernel delivers for a seccomp kill.
pub const SIGSYS: i32 = libc::SIGSYS;

/// Shortest pause between two monitor polls.
const MIN_POLL: Duration = Duration::from_millis(5);
/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with a status code, successful or not.
    Exited(i32),
    /// Killed by a signal that was not a policy kill.
    Signaled(i32),
    /// Killed by the kernel for a syscall outside the filter.
    PolicyViolation(ViolationRecord),
}

impl ExitOutcome {
    /// Returns `true` for a kernel policy kill.
    #[must_use]
    pub const fn is_policy_violation(&self) -> bool {
        matches!(self, Self::PolicyViolation(_))
    }

    /// Passes ordinary exits through and turns a policy kill into an error.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeViolationDetected` for [`ExitOutcome::PolicyViolation`].
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::PolicyViolation(record) => Err(SyswardenError::RuntimeViolationDetected {
                pid: record.pid,
                syscall: record.syscall_label(),
            }),
            other => Ok(other),
        }
    }

    /// Shell-style exit code: the status itself, or 128 plus the signal.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(sig) => 128 + *sig,
            Self::PolicyViolation(_) => 128 + SIGSYS,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig}"),
            Self::PolicyViolation(record) => {
                write!(f, "killed by seccomp policy on {}", record.syscall_label())
            }
        }
    }
}

/// How long to wait for the kernel's audit record after a kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditRetry {
    /// Number of reads, at least one is always made.
    pub attempts: u32,
    /// Pause between reads; also the monitor's polling interval.
    pub delay: Duration,
}

impl AuditRetry {
    fn interval(self) -> Duration {
        self.delay.max(MIN_POLL)
    }
}

impl Default for AuditRetry {
    fn default() -> Self {
        Self::from(&LaunchConfig::default())
    }
}

impl From<&LaunchConfig> for AuditRetry {
    fn from(config: &LaunchConfig) -> Self {
        Self {
            attempts: config.audit_retries,
            delay: Duration::from_millis(config.audit_retry_delay_ms),
        }
    }
}

/// Classifies exit statuses of processes running under one bundle.
#[derive(Debug, Clone)]
pub struct ExitClassifier {
    checksum: Sha256Hash,
    default_action: DefaultAction,
    retry: AuditRetry,
}

impl ExitClassifier {
    /// Creates a classifier for the bundle with `checksum` whose filter
    /// uses `default_action`.
    #[must_use]
    pub const fn new(checksum: Sha256Hash, default_action: DefaultAction, retry: AuditRetry) -> Self {
        Self {
            checksum,
            default_action,
            retry,
        }
    }

    /// Classifies the exit of `pid`.
    ///
    /// Only `SIGSYS` under a kill-process default action counts as a policy
    /// kill; any other status passes through unchanged. For a policy kill
    /// `audit` is read until it holds a record for `pid` or the retries run
    /// out. Records about other processes stay in the backlog.
    #[must_use]
    pub fn classify(&self, pid: u32, status: ExitStatus, audit: &mut AuditWatch) -> ExitOutcome {
        match status.signal() {
            Some(SIGSYS) if self.default_action == DefaultAction::KillProcess => {
                let syscall_nr = self.find_syscall(pid, audit);
                let record = self.violation(pid, syscall_nr);
                tracing::error!(
                    pid,
                    syscall = %record.syscall_label(),
                    checksum = %record.checksum,
                    "process killed by seccomp policy"
                );
                ExitOutcome::PolicyViolation(record)
            }
            Some(sig) => ExitOutcome::Signaled(sig),
            None => ExitOutcome::Exited(status.code().unwrap_or(-1)),
        }
    }

    /// A record of `pid` killed on syscall `syscall_nr` under this bundle.
    #[must_use]
    pub fn violation(&self, pid: u32, syscall_nr: Option<i64>) -> ViolationRecord {
        ViolationRecord {
            checksum: self.checksum.clone(),
            syscall: syscall_nr.and_then(|nr| SyscallResolver::new().name(nr)),
            syscall_nr,
            pid,
            timestamp: Utc::now(),
        }
    }

    fn find_syscall(&self, pid: u32, audit: &mut AuditWatch) -> Option<i64> {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            audit.refresh();
            if let Some(record) = audit.take(pid) {
                return Some(record.syscall_nr);
            }
            if attempt < attempts {
                std::thread::sleep(self.retry.delay);
            }
        }
        tracing::warn!(pid, attempts, "no seccomp audit record found");
        None
    }
}

/// State of one monitor thread.
struct Supervision {
    classifier: ExitClassifier,
    audit: AuditWatch,
    tree: ProcessTree,
    reported: BTreeSet<u32>,
    log: Option<ViolationLog>,
    tx: Sender<ViolationRecord>,
}

impl Supervision {
    fn run(mut self, mut child: Child) -> Result<ExitOutcome> {
        let pid = child.id();
        let interval = self.classifier.retry.interval();
        let status = loop {
            self.tree.refresh();
            self.sweep();
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => std::thread::sleep(interval),
                Err(e) => {
                    return Err(SyswardenError::Process {
                        message: format!("waiting for pid {pid}: {e}"),
                    });
                }
            }
        };

        let outcome = self.classifier.classify(pid, status, &mut self.audit);
        if let ExitOutcome::PolicyViolation(record) = &outcome {
            self.report(record.clone());
        }
        // Kills logged just before the root exited.
        self.sweep();
        std::thread::sleep(interval);
        self.sweep();
        tracing::info!(
            pid,
            outcome = %outcome,
            workers_killed = self
                .reported
                .len()
                .saturating_sub(usize::from(outcome.is_policy_violation())),
            "supervised process finished"
        );
        Ok(outcome)
    }

    /// Reports kill records for processes below the root.
    fn sweep(&mut self) {
        self.audit.refresh();
        for record in self.audit.take_others(self.tree.root()) {
            if self.reported.contains(&record.pid) {
                continue;
            }
            if self.tree.owns(&record) {
                self.worker_killed(&record);
            } else {
                tracing::debug!(pid = record.pid, "kill record for an unrelated process");
            }
        }
    }

    fn worker_killed(&mut self, audit: &AuditRecord) {
        let record = self.classifier.violation(audit.pid, Some(audit.syscall_nr));
        tracing::error!(
            root = self.tree.root(),
            pid = audit.pid,
            syscall = %record.syscall_label(),
            checksum = %record.checksum,
            "worker process killed by seccomp policy"
        );
        self.report(record);
    }

    fn report(&mut self, record: ViolationRecord) {
        if !self.reported.insert(record.pid) {
            return;
        }
        if let Some(log) = &self.log {
            if let Err(e) = log.append(&record) {
                tracing::warn!(
                    path = %log.path().display(),
                    error = %e,
                    "cannot append violation record"
                );
            }
        }
        let _ = self.tx.send(record);
    }
}

/// Watches one child process and its descendants on a dedicated thread.
#[derive(Debug)]
pub struct Monitor {
    pid: u32,
    violations: Receiver<ViolationRecord>,
    handle: JoinHandle<Result<ExitOutcome>>,
}

impl Monitor {
    /// Takes ownership of `child` and starts watching it.
    ///
    /// `audit` must have been opened before the child was started. Policy
    /// kills are appended to `log` when one is given. A failing append is
    /// logged; it does not change the outcome.
    ///
    /// # Errors
    ///
    /// Returns a process error if the thread cannot be started.
    pub fn spawn(
        child: Child,
        classifier: ExitClassifier,
        audit: AuditWatch,
        log: Option<ViolationLog>,
    ) -> Result<Self> {
        let pid = child.id();
        let (tx, violations) = mpsc::channel();
        let supervision = Supervision {
            classifier,
            audit,
            tree: ProcessTree::new(pid),
            reported: BTreeSet::new(),
            log,
            tx,
        };
        let handle = std::thread::Builder::new()
            .name(format!("swd-monitor-{pid}"))
            .spawn(move || supervision.run(child))
            .map_err(|e| SyswardenError::Process {
                message: format!("cannot start monitor thread: {e}"),
            })?;
        Ok(Self {
            pid,
            violations,
            handle,
        })
    }

    /// PID of the supervised process.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Violation records, delivered as they are detected.
    #[must_use]
    pub const fn violations(&self) -> &Receiver<ViolationRecord> {
        &self.violations
    }

    /// Returns `true` once the process has been reaped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the process has exited and been classified.
    ///
    /// # Errors
    ///
    /// Returns a process error if waiting failed or the monitor panicked.
    pub fn wait(self) -> Result<ExitOutcome> {
        self.finish().map(|(outcome, _)| outcome)
    }

    /// Like [`Monitor::wait`], also returning the violation records not yet
    /// taken from the channel.
    ///
    /// # Errors
    ///
    /// Returns a process error if waiting failed or the monitor panicked.
    pub fn finish(self) -> Result<(ExitOutcome, Vec<ViolationRecord>)> {
        let outcome = self.handle.join().map_err(|_| SyswardenError::Process {
            message: format!("monitor thread for pid {} panicked", self.pid),
        })??;
        Ok((outcome, self.violations.try_iter().collect()))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use chrono::{DateTime, TimeZone as _};

    use super::*;
    use crate::audit::{AuditCursor, StaticAudit};

    /// Reports a kill on `nr` for the monitored child once its pid is known.
    struct ChildKill {
        nr: i64,
        pid: std::sync::Arc<std::sync::Mutex<Option<u32>>>,
    }

    impl AuditCursor for ChildKill {
        fn poll(&mut self) -> Result<Vec<AuditRecord>> {
            let pid = self.pid.lock().unwrap().take();
            Ok(pid
                .map(|pid| {
                    crate::audit::parse_line(&kill_line(pid, self.nr, None, Utc::now())).unwrap()
                })
                .into_iter()
                .collect())
        }
    }

    fn kill_line(pid: u32, nr: i64, session: Option<u32>, at: DateTime<Utc>) -> String {
        let ses = session.map_or_else(String::new, |s| format!("ses={s} "));
        format!(
            "type=SECCOMP msg=audit({}.{:03}:1): {ses}pid={pid} comm=\"server\" sig=31 \
             arch=c000003e syscall={nr} code=0x80000000\n",
            at.timestamp(),
            at.timestamp_subsec_millis()
        )
    }

    fn checksum() -> Sha256Hash {
        Sha256Hash::from_hex("c".repeat(64)).unwrap()
    }

    fn no_wait() -> AuditRetry {
        AuditRetry {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }

    fn classifier(action: DefaultAction) -> ExitClassifier {
        ExitClassifier::new(checksum(), action, no_wait())
    }

    fn watch(text: &str) -> AuditWatch {
        AuditWatch::follow(&StaticAudit::new(text), Utc::now() - chrono::Duration::seconds(5))
            .unwrap()
    }

    fn session() -> Option<u32> {
        std::fs::read_to_string("/proc/self/sessionid")
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    #[test]
    fn sigsys_matches_the_kernel_signal() {
        assert_eq!(SIGSYS, nix::sys::signal::Signal::SIGSYS as i32);
    }

    #[test]
    fn sigsys_under_kill_process_is_a_policy_kill() {
        let mut audit = watch(&kill_line(4242, 101, Some(2), Utc::now()));
        let outcome = classifier(DefaultAction::KillProcess).classify(
            4242,
            ExitStatus::from_raw(SIGSYS),
            &mut audit,
        );

        let ExitOutcome::PolicyViolation(record) = &outcome else {
            unreachable!("expected a policy violation, got {outcome}");
        };
        assert_eq!(record.pid, 4242);
        assert_eq!(record.syscall_nr, Some(101));
        assert!(record.syscall.is_some());
        assert_eq!(record.checksum, checksum());
        assert_eq!(outcome.exit_code(), 128 + SIGSYS);

        let err = outcome.into_result().unwrap_err();
        assert!(matches!(
            err,
            SyswardenError::RuntimeViolationDetected { pid: 4242, .. }
        ));
    }

    #[test]
    fn stale_record_for_a_reused_pid_is_not_used() {
        let old = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
        let mut audit = watch(&kill_line(4242, 101, Some(2), old));
        let outcome = classifier(DefaultAction::KillProcess).classify(
            4242,
            ExitStatus::from_raw(SIGSYS),
            &mut audit,
        );
        let ExitOutcome::PolicyViolation(record) = outcome else {
            unreachable!("expected a policy violation");
        };
        assert_eq!(record.syscall_nr, None);
        assert_eq!(record.syscall_label(), "unknown");
    }

    #[test]
    fn policy_kill_without_audit_record_is_unknown() {
        let outcome = classifier(DefaultAction::KillProcess).classify(
            7,
            ExitStatus::from_raw(SIGSYS),
            &mut watch(""),
        );
        let err = outcome.into_result().unwrap_err();
        assert!(err.to_string().contains("unknown"), "{err}");
    }

    #[test]
    fn ordinary_exits_pass_through() {
        let c = classifier(DefaultAction::KillProcess);
        let mut audit = watch(&kill_line(1, 101, None, Utc::now()));
        assert_eq!(c.classify(1, ExitStatus::from_raw(0), &mut audit), ExitOutcome::Exited(0));
        let exited = c.classify(1, ExitStatus::from_raw(3 << 8), &mut audit);
        assert_eq!(exited, ExitOutcome::Exited(3));
        assert_eq!(exited.exit_code(), 3);
        let signaled = c.classify(1, ExitStatus::from_raw(9), &mut audit);
        assert_eq!(signaled, ExitOutcome::Signaled(9));
        assert_eq!(signaled.exit_code(), 137);
        assert_eq!(
            c.classify(1, ExitStatus::from_raw(3 << 8), &mut audit)
                .into_result()
                .unwrap(),
            ExitOutcome::Exited(3)
        );
    }

    #[test]
    fn sigsys_under_errno_action_is_not_a_policy_kill() {
        let c = classifier(DefaultAction::Errno(1));
        assert_eq!(
            c.classify(1, ExitStatus::from_raw(SIGSYS), &mut watch("")),
            ExitOutcome::Signaled(SIGSYS)
        );
    }

    #[test]
    fn monitor_emits_exactly_one_record_for_a_kill() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = ViolationLog::new(dir.path().join("violations.jsonl"));
        let slot = std::sync::Arc::new(std::sync::Mutex::new(None));
        let child = Command::new("sh")
            .args(["-c", "sleep 0.2; kill -s SYS $$"])
            .spawn()
            .expect("spawn sh");
        *slot.lock().unwrap() = Some(child.id());
        let audit = AuditWatch::new(Box::new(ChildKill { nr: 57, pid: slot }));

        let monitor = Monitor::spawn(
            child,
            classifier(DefaultAction::KillProcess),
            audit,
            Some(log.clone()),
        )
        .unwrap();
        let pid = monitor.pid();
        let record = monitor.violations().recv().unwrap();
        assert_eq!(record.pid, pid);
        assert_eq!(record.syscall_nr, Some(57));

        let (outcome, rest) = monitor.finish().unwrap();
        assert!(outcome.is_policy_violation());
        assert!(rest.is_empty());
        assert_eq!(log.read().unwrap().len(), 1);
    }

    #[test]
    fn worker_kill_is_reported_while_the_root_exits_cleanly() {
        let Some(ses) = session() else {
            return;
        };
        // A worker that was already reaped, known only by its session.
        let worker = 4_194_305;
        let foreign = std::process::id();
        let text = format!(
            "{}{}",
            kill_line(worker, 63, Some(ses), Utc::now()),
            kill_line(foreign, 41, Some(ses), Utc::now())
        );
        let child = Command::new("sh")
            .args(["-c", "exit 0"])
            .spawn()
            .expect("spawn sh");
        let monitor = Monitor::spawn(
            child,
            classifier(DefaultAction::KillProcess),
            watch(&text),
            None,
        )
        .unwrap();

        let (outcome, records) = monitor.finish().unwrap();
        assert_eq!(outcome, ExitOutcome::Exited(0));
        assert_eq!(records.len(), 1, "{records:?}");
        assert_eq!(records[0].pid, worker);
        assert_eq!(records[0].syscall_nr, Some(63));
        assert_eq!(records[0].checksum, checksum());
    }

    #[test]
    fn monitor_passes_through_normal_exit() {
        let child = Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .expect("spawn sh");
        let monitor = Monitor::spawn(
            child,
            classifier(DefaultAction::KillProcess),
            watch(""),
            None,
        )
        .unwrap();
        assert!(monitor.violations().recv().is_err());
        assert_eq!(monitor.wait().unwrap(), ExitOutcome::Exited(3));
    }
}
