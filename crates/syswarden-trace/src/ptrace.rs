//! ptrace-based syscall interception (Linux).
//!
//! Every thread of the target is a separate tracee. The loop waits on all of
//! them with `__WALL`, records syscall-entry stops, follows
//! clone/fork/vfork automatically, and resumes each tracee independently,
//! so no lock is held over the traced process beyond the per-stop handoff
//! ptrace itself requires.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::os::unix::process::CommandExt as _;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace::{self, Event, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use syswarden_common::constants;
use syswarden_common::error::{Result, SyswardenError};

use crate::backend::{Recorder, TraceBackend};
use crate::event::StopReason;
use crate::resolve::SyscallResolver;
use crate::session::TraceTarget;

/// Sleep between non-blocking wait polls when no tracee has stopped.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Upper bound on wait calls while reaping tracees after the session.
const MAX_REAP_ROUNDS: usize = 10_000;

/// Traces targets with `ptrace(2)`.
#[derive(Debug, Default)]
pub struct PtraceBackend {
    resolver: SyscallResolver,
}

impl PtraceBackend {
    /// Creates a backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Checks whether this host allows ptrace at all.
///
/// # Errors
///
/// Returns `TracingUnavailable` when Yama forbids ptrace entirely
/// (`ptrace_scope` = 3).
pub fn check_available() -> Result<()> {
    if let Ok(scope) = std::fs::read_to_string(constants::YAMA_PTRACE_SCOPE) {
        if scope.trim() == "3" {
            return Err(SyswardenError::TracingUnavailable {
                reason: format!("{} is 3 (ptrace disabled)", constants::YAMA_PTRACE_SCOPE),
            });
        }
    }
    Ok(())
}

fn trace_options() -> Options {
    Options::PTRACE_O_TRACESYSGOOD
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACEEXEC
}

fn unavailable(context: &str, errno: Errno) -> SyswardenError {
    match errno {
        Errno::EPERM | Errno::EACCES => SyswardenError::TracingUnavailable {
            reason: format!("{context}: {errno}"),
        },
        _ => SyswardenError::Process {
            message: format!("{context}: {errno}"),
        },
    }
}

/// Book-keeping for live tracees.
#[derive(Debug, Default)]
struct Tracees {
    /// tid -> (tgid, currently inside a syscall).
    threads: HashMap<Pid, (u32, bool)>,
    /// Tracees announced by a clone event whose initial SIGSTOP is pending.
    fresh: HashSet<Pid>,
}

impl Tracees {
    fn insert(&mut self, tid: Pid) {
        let tgid = read_tgid(tid).unwrap_or_else(|| raw(tid));
        let _ = self.threads.entry(tid).or_insert((tgid, false));
    }

    /// Flips the in-syscall flag and returns `true` on entry.
    fn toggle(&mut self, tid: Pid) -> bool {
        if !self.threads.contains_key(&tid) {
            self.insert(tid);
        }
        self.threads.get_mut(&tid).is_some_and(|(_, inside)| {
            *inside = !*inside;
            *inside
        })
    }

    /// A non-leader thread that calls `execve` takes over the leader's tid
    /// and the old tid vanishes without an exit report.
    fn exec(&mut self, tid: Pid, former: Pid) {
        if former == tid {
            return;
        }
        let inside = self.threads.remove(&former).is_some_and(|(_, inside)| inside);
        let tgid = raw(tid);
        let _ = self.threads.insert(tid, (tgid, inside));
    }

    fn tgid(&self, tid: Pid) -> u32 {
        self.threads.get(&tid).map_or_else(|| raw(tid), |(tgid, _)| *tgid)
    }

    fn remove(&mut self, tid: Pid) {
        let _ = self.threads.remove(&tid);
        let _ = self.fresh.remove(&tid);
    }

    fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    fn tids(&self) -> Vec<Pid> {
        self.threads.keys().copied().collect()
    }

    fn tgids(&self) -> HashSet<u32> {
        self.threads.values().map(|(tgid, _)| *tgid).collect()
    }
}

fn raw(pid: Pid) -> u32 {
    u32::try_from(pid.as_raw()).unwrap_or_default()
}

fn to_pid(pid: u32) -> Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| SyswardenError::Config {
            message: format!("pid out of range: {pid}"),
        })
}

fn read_tgid(tid: Pid) -> Option<u32> {
    let status = std::fs::read_to_string(format!("/proc/{tid}/status")).ok()?;
    status
        .lines()
        .find_map(|l| l.strip_prefix("Tgid:"))
        .and_then(|v| v.trim().parse().ok())
}

fn list_tasks(pid: Pid) -> Result<Vec<Pid>> {
    let dir = format!("/proc/{pid}/task");
    let entries = std::fs::read_dir(&dir).map_err(|e| SyswardenError::io(&dir, e))?;
    Ok(entries
        .filter_map(std::result::Result::ok)
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<i32>().ok()))
        .map(Pid::from_raw)
        .collect())
}

#[cfg(target_arch = "x86_64")]
fn syscall_number(tid: Pid) -> nix::Result<i64> {
    ptrace::getregs(tid).map(|regs| regs.orig_rax as i64)
}

#[cfg(target_arch = "aarch64")]
fn syscall_number(tid: Pid) -> nix::Result<i64> {
    ptrace::getregs(tid).map(|regs| regs.regs[8] as i64)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn syscall_number(_tid: Pid) -> nix::Result<i64> {
    Err(Errno::ENOSYS)
}

/// Resumes a tracee, ignoring tracees that vanished in the meantime.
fn resume(tid: Pid, sig: Option<Signal>) -> Result<()> {
    match ptrace::syscall(tid, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SyswardenError::Process {
            message: format!("cannot resume tracee {tid}: {e}"),
        }),
    }
}

impl PtraceBackend {
    fn spawn(program: &std::path::Path, args: &[String], env: &[(String, String)]) -> Result<Pid> {
        let mut cmd = std::process::Command::new(program);
        let _ = cmd.args(args).envs(env.iter().map(|(k, v)| (k, v)));
        // SAFETY: the closure only issues PTRACE_TRACEME, which does not
        // allocate or take locks.
        unsafe {
            let _ = cmd.pre_exec(|| ptrace::traceme().map_err(std::io::Error::from));
        }
        let child = cmd.spawn().map_err(|e| match e.raw_os_error() {
            Some(code) if code == libc::EPERM || code == libc::EACCES => {
                SyswardenError::TracingUnavailable {
                    reason: format!("PTRACE_TRACEME refused: {e}"),
                }
            }
            _ => SyswardenError::io(program, e),
        })?;
        let pid = Pid::from_raw(i32::try_from(child.id()).unwrap_or_default());

        // The child stops with SIGTRAP once execve has completed.
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {}
            Ok(other) => {
                return Err(SyswardenError::Process {
                    message: format!("unexpected initial state of traced child: {other:?}"),
                });
            }
            Err(e) => return Err(unavailable("waiting for traced child", e)),
        }
        ptrace::setoptions(pid, trace_options() | Options::PTRACE_O_EXITKILL)
            .map_err(|e| unavailable("PTRACE_SETOPTIONS", e))?;
        resume(pid, None)?;
        tracing::debug!(%pid, "spawned traced child");
        Ok(pid)
    }

    /// Seizes every thread of `pid`, rescanning until no new thread appears
    /// so threads created during attachment are not missed.
    fn seize(pid: Pid, tracees: &mut Tracees) -> Result<()> {
        loop {
            let mut added = 0usize;
            for tid in list_tasks(pid)? {
                if tracees.threads.contains_key(&tid) {
                    continue;
                }
                match ptrace::seize(tid, trace_options()) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => continue,
                    Err(e) => return Err(unavailable("PTRACE_SEIZE", e)),
                }
                ptrace::interrupt(tid).map_err(|e| unavailable("PTRACE_INTERRUPT", e))?;
                tracees.insert(tid);
                added += 1;
            }
            if added == 0 {
                break;
            }
        }
        tracing::debug!(%pid, threads = tracees.threads.len(), "seized target threads");
        Ok(())
    }

    /// Records a syscall-entry stop. Returns the cap signal from the recorder.
    fn on_syscall_stop(
        &mut self,
        tid: Pid,
        tracees: &mut Tracees,
        recorder: &mut Recorder,
    ) -> ControlFlow<StopReason> {
        if !tracees.toggle(tid) {
            return ControlFlow::Continue(());
        }
        let nr = match syscall_number(tid) {
            Ok(nr) => nr,
            Err(e) => {
                tracing::debug!(%tid, error = %e, "cannot read syscall registers");
                return ControlFlow::Continue(());
            }
        };
        match self.resolver.name(nr) {
            Some(name) => recorder.record(tracees.tgid(tid), raw(tid), name),
            None => ControlFlow::Continue(()),
        }
    }

    fn event_loop(
        &mut self,
        tracees: &mut Tracees,
        recorder: &mut Recorder,
    ) -> Result<(StopReason, Option<Pid>)> {
        loop {
            if let Some(reason) = recorder.check() {
                return Ok((reason, None));
            }
            let status = match waitpid(None, Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok((StopReason::TargetExited, None)),
                Err(e) => {
                    return Err(SyswardenError::Process {
                        message: format!("waitpid failed: {e}"),
                    });
                }
            };
            match status {
                WaitStatus::StillAlive => std::thread::sleep(POLL_INTERVAL),
                WaitStatus::PtraceSyscall(tid) => {
                    if let ControlFlow::Break(reason) =
                        self.on_syscall_stop(tid, tracees, recorder)
                    {
                        // Left stopped; detaching picks it up from here.
                        return Ok((reason, Some(tid)));
                    }
                    resume(tid, None)?;
                }
                WaitStatus::PtraceEvent(tid, _, event) => {
                    let forked = [
                        Event::PTRACE_EVENT_CLONE as i32,
                        Event::PTRACE_EVENT_FORK as i32,
                        Event::PTRACE_EVENT_VFORK as i32,
                    ];
                    if forked.contains(&event) {
                        if let Ok(new) = ptrace::getevent(tid) {
                            let new = Pid::from_raw(i32::try_from(new).unwrap_or_default());
                            tracees.insert(new);
                            let _ = tracees.fresh.insert(new);
                            tracing::trace!(parent = %tid, child = %new, "following new tracee");
                        }
                    } else if event == Event::PTRACE_EVENT_EXEC as i32 {
                        if let Ok(former) = ptrace::getevent(tid) {
                            let former = Pid::from_raw(i32::try_from(former).unwrap_or_default());
                            tracees.exec(tid, former);
                            tracing::trace!(tid = %tid, former = %former, "tracee exec'd");
                        }
                    }
                    resume(tid, None)?;
                }
                WaitStatus::Stopped(tid, sig) => {
                    let initial_stop = sig == Signal::SIGSTOP
                        && (tracees.fresh.remove(&tid) || !tracees.threads.contains_key(&tid));
                    if initial_stop {
                        tracees.insert(tid);
                        resume(tid, None)?;
                    } else {
                        resume(tid, Some(sig))?;
                    }
                }
                WaitStatus::Exited(tid, _) | WaitStatus::Signaled(tid, _, _) => {
                    tracees.remove(tid);
                    if tracees.is_empty() {
                        return Ok((StopReason::TargetExited, None));
                    }
                }
                WaitStatus::Continued(_) => {}
            }
        }
    }

    /// Detaches from every tracee, recording any syscall entry that was in
    /// flight when the session ended.
    fn detach_all(
        &mut self,
        tracees: &mut Tracees,
        recorder: &mut Recorder,
        already_stopped: Option<Pid>,
    ) {
        for tid in tracees.tids() {
            let mut pending_signal = None;
            if Some(tid) != already_stopped {
                if ptrace::interrupt(tid).is_err() {
                    continue;
                }
                loop {
                    match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                        Ok(WaitStatus::PtraceSyscall(_)) => {
                            let _ = self.on_syscall_stop(tid, tracees, recorder);
                            if resume(tid, None).is_err() {
                                break;
                            }
                        }
                        Ok(WaitStatus::Stopped(_, sig)) => {
                            pending_signal = Some(sig);
                            if resume(tid, None).is_err() {
                                break;
                            }
                        }
                        Ok(WaitStatus::PtraceEvent(..)) => break,
                        Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(_) => {
                            tracees.remove(tid);
                            break;
                        }
                        Ok(_) => {}
                    }
                }
            }
            if tracees.threads.contains_key(&tid) {
                if let Err(e) = ptrace::detach(tid, pending_signal) {
                    tracing::debug!(%tid, error = %e, "detach failed");
                }
            }
        }
        tracing::debug!("detached from target");
    }

    /// Kills a spawned target (and everything it forked) and reaps it.
    fn kill_all(tracees: &mut Tracees) {
        for tgid in tracees.tgids() {
            if let Ok(pid) = i32::try_from(tgid) {
                let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
        for _ in 0..MAX_REAP_ROUNDS {
            match waitpid(None, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(tid, _) | WaitStatus::Signaled(tid, _, _)) => {
                    tracees.remove(tid);
                }
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(WaitStatus::PtraceSyscall(tid) | WaitStatus::PtraceEvent(tid, _, _)) => {
                    let _ = resume(tid, None);
                }
                Ok(WaitStatus::Stopped(tid, _)) => {
                    let _ = resume(tid, None);
                }
                Ok(_) | Err(_) => {}
            }
            if tracees.is_empty() {
                break;
            }
        }
        tracing::debug!("spawned target terminated");
    }
}

impl TraceBackend for PtraceBackend {
    fn name(&self) -> &'static str {
        "ptrace"
    }

    fn trace(
        &mut self,
        target: &TraceTarget,
        recorder: &mut Recorder,
        on_ready: &mut dyn FnMut(u32),
    ) -> Result<StopReason> {
        check_available()?;
        let mut tracees = Tracees::default();

        let root = match target {
            TraceTarget::Spawn { program, args, env } => {
                let pid = Self::spawn(program, args, env)?;
                tracees.insert(pid);
                pid
            }
            TraceTarget::Attach { pid } => {
                let pid = to_pid(*pid)?;
                Self::seize(pid, &mut tracees)?;
                pid
            }
        };
        on_ready(raw(root));

        let outcome = self.event_loop(&mut tracees, recorder);
        let stopped = outcome.as_ref().ok().and_then(|(_, stopped)| *stopped);
        match target {
            TraceTarget::Spawn { .. } => Self::kill_all(&mut tracees),
            TraceTarget::Attach { .. } => self.detach_all(&mut tracees, recorder, stopped),
        }
        outcome.map(|(reason, _)| reason)
    }
}
