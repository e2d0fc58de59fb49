//! Starting a target under a policy bundle.
//!
//! Everything that can fail or allocate happens before the fork: bundle
//! verification, the executable digest check, filter compilation and the
//! Landlock ruleset. The child then applies Landlock, installs the seccomp
//! filter and execs. This is the only point where policy is installed.

use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc::Receiver;

use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use syswarden_common::config::LaunchConfig;
use syswarden_common::error::{Result, SyswardenError};
use syswarden_common::types::{Sha256Hash, TargetIdentity};
use syswarden_policy::bundle::PolicyBundle;
use syswarden_policy::checksum::hash_file;

use crate::audit::{AuditSource, AuditTrail, AuditWatch};
use crate::dependencies::runtime_paths;
use crate::jail::Jail;
use crate::monitor::{AuditRetry, ExitClassifier, ExitOutcome, Monitor};
use crate::seccomp::CompiledFilter;
use crate::violations::{ViolationLog, ViolationRecord};

/// Resolves a bare program name through `PATH`; paths are used as given.
///
/// # Errors
///
/// Returns `NotFound` if a bare name is not on `PATH`.
pub fn resolve_executable(program: &Path) -> Result<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return Ok(program.to_path_buf());
    }
    which::which(program).map_err(|_| SyswardenError::NotFound {
        kind: "executable",
        id: program.display().to_string(),
    })
}

/// Checks `executable` against the digest recorded in `target`.
///
/// Identities without a digest accept any executable.
///
/// # Errors
///
/// Returns `TargetMismatch` if the digests differ, or an I/O error if the
/// executable cannot be read.
pub fn check_target(target: &TargetIdentity, executable: &Path) -> Result<()> {
    let Some(expected) = &target.digest else {
        tracing::debug!(target = %target, "target identity has no digest, skipping check");
        return Ok(());
    };
    let actual = hash_file(executable)?;
    if &actual == expected {
        Ok(())
    } else {
        tracing::error!(
            executable = %executable.display(),
            %expected,
            %actual,
            "executable does not match bundle target"
        );
        Err(SyswardenError::TargetMismatch {
            path: executable.to_path_buf(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Where a launched process's standard streams go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioMode {
    /// Shared with the launcher.
    #[default]
    Inherit,
    /// Discarded.
    Null,
}

impl StdioMode {
    fn stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Null => Stdio::null(),
        }
    }
}

/// Launches processes under policy bundles.
#[derive(Clone)]
pub struct Launcher {
    audit: Arc<dyn AuditSource>,
    retry: AuditRetry,
    log: Option<ViolationLog>,
    stdio: StdioMode,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("audit", &self.audit.name())
            .field("retry", &self.retry)
            .field("log", &self.log)
            .field("stdio", &self.stdio)
            .finish()
    }
}

impl Launcher {
    /// Creates a launcher reading the audit trail and writing violations
    /// where `config` says.
    #[must_use]
    pub fn new(config: &LaunchConfig) -> Self {
        Self {
            audit: Arc::new(AuditTrail::from_config(config)),
            retry: AuditRetry::from(config),
            log: Some(ViolationLog::new(config.violation_log.clone())),
            stdio: StdioMode::Inherit,
        }
    }

    /// Reads policy kills from `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSource>, retry: AuditRetry) -> Self {
        self.audit = audit;
        self.retry = retry;
        self
    }

    /// Writes violation records to `log`, or nowhere.
    #[must_use]
    pub fn with_violation_log(mut self, log: Option<ViolationLog>) -> Self {
        self.log = log;
        self
    }

    /// Sets where the child's standard streams go.
    #[must_use]
    pub const fn with_stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    /// Starts `executable args...` confined by `bundle`.
    ///
    /// # Errors
    ///
    /// Returns `BundleChecksumMismatch` or `TargetMismatch` before anything
    /// is started, `Seccomp`/`Landlock` if the policy cannot be prepared,
    /// or a process error if the child fails to start or to install it.
    pub fn launch(
        &self,
        bundle: &PolicyBundle,
        executable: &Path,
        args: &[String],
    ) -> Result<SupervisedProcess> {
        bundle.verify()?;
        let executable = resolve_executable(executable)?;
        check_target(bundle.target(), &executable)?;

        let filter = CompiledFilter::compile(bundle.filter())?;
        let mut jail = Jail::build(bundle.paths(), &runtime_paths(&executable))?;

        // Opened before the child exists so nothing it triggers is missed.
        let audit = AuditWatch::follow(self.audit.as_ref(), Utc::now())?;

        let mut cmd = Command::new(&executable);
        let _ = cmd
            .args(args)
            .stdin(self.stdio.stdio())
            .stdout(self.stdio.stdio())
            .stderr(self.stdio.stdio());
        // SAFETY: the closure only issues landlock_restrict_self, prctl and
        // seccomp on data prepared before the fork.
        unsafe {
            let _ = cmd.pre_exec(move || {
                jail.restrict()?;
                filter.install()
            });
        }
        let child = cmd.spawn().map_err(|e| SyswardenError::Process {
            message: format!("starting {} under policy: {e}", executable.display()),
        })?;
        let pid = child.id();
        tracing::info!(
            pid,
            executable = %executable.display(),
            checksum = %bundle.checksum(),
            filter_version = bundle.filter().version(),
            "launched confined process"
        );

        let classifier = ExitClassifier::new(
            bundle.checksum().clone(),
            bundle.filter().default_action(),
            self.retry,
        );
        let monitor = Monitor::spawn(child, classifier, audit, self.log.clone())?;
        Ok(SupervisedProcess {
            checksum: bundle.checksum().clone(),
            executable,
            monitor,
        })
    }
}

/// Launches with the default configuration.
///
/// # Errors
///
/// See [`Launcher::launch`].
pub fn launch(
    bundle: &PolicyBundle,
    executable: &Path,
    args: &[String],
) -> Result<SupervisedProcess> {
    Launcher::new(&LaunchConfig::default()).launch(bundle, executable, args)
}

/// A running process confined by a bundle.
///
/// The policy it was started with is fixed for its lifetime; this handle
/// can observe and stop the process but not change what it may do.
#[derive(Debug)]
pub struct SupervisedProcess {
    checksum: Sha256Hash,
    executable: PathBuf,
    monitor: Monitor,
}

impl SupervisedProcess {
    /// PID of the process.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.monitor.pid()
    }

    /// Checksum of the bundle the process runs under.
    #[must_use]
    pub const fn checksum(&self) -> &Sha256Hash {
        &self.checksum
    }

    /// Executable that was started.
    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Violation records as they are detected, for the process and every
    /// worker below it.
    #[must_use]
    pub const fn violations(&self) -> &Receiver<ViolationRecord> {
        self.monitor.violations()
    }

    /// Returns `true` once the process has exited.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.monitor.is_finished()
    }

    /// Sends `SIGTERM`.
    ///
    /// # Errors
    ///
    /// Returns a process error if the signal cannot be delivered.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Sends `SIGKILL`.
    ///
    /// # Errors
    ///
    /// Returns a process error if the signal cannot be delivered.
    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        let pid = i32::try_from(self.pid()).map_err(|_| SyswardenError::Process {
            message: format!("pid {} out of range", self.pid()),
        })?;
        signal::kill(Pid::from_raw(pid), sig).map_err(|e| SyswardenError::Process {
            message: format!("sending {sig:?} to pid {pid}: {e}"),
        })
    }

    /// Waits for the process and classifies its exit.
    ///
    /// # Errors
    ///
    /// Returns a process error if the process could not be waited for.
    pub fn wait(self) -> Result<ExitOutcome> {
        self.monitor.wait()
    }

    /// Waits for the process, returning its outcome together with the
    /// violation records not yet taken from [`SupervisedProcess::violations`].
    ///
    /// # Errors
    ///
    /// Returns a process error if the process could not be waited for.
    pub fn finish(self) -> Result<(ExitOutcome, Vec<ViolationRecord>)> {
        self.monitor.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use syswarden_common::types::{Provenance, SyscallName};
    use syswarden_policy::bundle::assemble;
    use syswarden_policy::paths::PathPermissionProfile;
    use syswarden_profile::synthesizer::synthesize;
    use syswarden_profile::usage::SyscallUsageSet;

    use super::*;

    fn bundle_for(target: TargetIdentity) -> PolicyBundle {
        let usage: SyscallUsageSet = ["write", "wait4", "clone"]
            .into_iter()
            .map(|n| (SyscallName::new(n).unwrap(), Provenance::Observed))
            .collect();
        let filter = synthesize(&usage).unwrap();
        assemble(
            &filter,
            &PathPermissionProfile::default(),
            target,
            &[PathBuf::from("/srv/app")],
        )
        .unwrap()
    }

    #[test]
    fn bare_names_resolve_through_path() {
        let sh = resolve_executable(Path::new("sh")).unwrap();
        assert!(sh.is_absolute());
        assert_eq!(
            resolve_executable(Path::new("./run")).unwrap(),
            PathBuf::from("./run")
        );
        assert!(matches!(
            resolve_executable(Path::new("no-such-program-syswarden")),
            Err(SyswardenError::NotFound { .. })
        ));
    }

    #[test]
    fn digest_mismatch_refuses_launch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = dir.path().join("server");
        std::fs::write(&exe, b"v1").unwrap();
        let target = TargetIdentity::new("web", &exe).with_digest(hash_file(&exe).unwrap());
        check_target(&target, &exe).unwrap();

        std::fs::write(&exe, b"v2").unwrap();
        let err = check_target(&target, &exe).unwrap_err();
        assert!(matches!(err, SyswardenError::TargetMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn tampered_bundle_is_refused_before_start() {
        let bundle = bundle_for(TargetIdentity::new("sh", "/bin/sh"));
        let mut manifest = bundle.manifest().clone();
        manifest.checksum = Sha256Hash::from_hex("0".repeat(64)).unwrap();
        let tampered = bundle.with_manifest(manifest);

        let err = Launcher::new(&LaunchConfig::default())
            .with_violation_log(None)
            .launch(&tampered, Path::new("/bin/sh"), &[])
            .unwrap_err();
        assert!(matches!(err, SyswardenError::BundleChecksumMismatch { .. }));
    }

    #[test]
    fn launcher_reports_its_collaborators() {
        let launcher = Launcher::new(&LaunchConfig::default()).with_stdio(StdioMode::Null);
        let shown = format!("{launcher:?}");
        assert!(shown.contains("audit-trail"));
        assert!(shown.contains("Null"));
    }
}
