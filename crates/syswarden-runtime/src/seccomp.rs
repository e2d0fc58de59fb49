//! Compiles filter profiles to seccomp BPF and installs them.
//!
//! Compilation happens in the parent with libseccomp. The child only gets a
//! ready `sock_filter` array and issues `prctl` plus `seccomp(2)`, neither
//! of which allocates, so it is safe between `fork` and `exec`.

use std::io::{Read as _, Seek as _, SeekFrom};
use std::str::FromStr as _;

use libseccomp::{ScmpAction, ScmpArch, ScmpFilterContext, ScmpSyscall};
use syswarden_common::error::{Result, SyswardenError};
use syswarden_common::types::SyscallName;
use syswarden_profile::filter::{DefaultAction, FilterProfile};

/// Size of one `struct sock_filter`.
const INSN_LEN: usize = 8;

/// Longest program the kernel accepts (`BPF_MAXINSNS`).
const MAX_INSNS: usize = 4096;

fn seccomp_err(context: &str, e: impl std::fmt::Display) -> SyswardenError {
    SyswardenError::Seccomp {
        message: format!("{context}: {e}"),
    }
}

fn scmp_action(action: DefaultAction) -> ScmpAction {
    match action {
        DefaultAction::KillProcess => ScmpAction::KillProcess,
        DefaultAction::Errno(errno) => ScmpAction::Errno(i32::from(errno)),
        DefaultAction::Log => ScmpAction::Log,
    }
}

/// A BPF program ready to be installed.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    program: Vec<libc::sock_filter>,
    unresolved: Vec<SyscallName>,
}

impl CompiledFilter {
    /// Compiles `profile` for its architectures.
    ///
    /// Names libseccomp does not know on this host are left out, which can
    /// only make the filter stricter; they are listed in
    /// [`unresolved`](Self::unresolved).
    ///
    /// # Errors
    ///
    /// Returns `Seccomp` if libseccomp rejects the filter or the program is
    /// too long for the kernel.
    pub fn compile(profile: &FilterProfile) -> Result<Self> {
        let mut ctx = ScmpFilterContext::new(scmp_action(profile.default_action()))
            .map_err(|e| seccomp_err("creating filter", e))?;
        for arch in profile.architectures() {
            let parsed = ScmpArch::from_str(arch).map_err(|e| seccomp_err(arch, e))?;
            let _ = ctx
                .add_arch(parsed)
                .map_err(|e| seccomp_err("adding architecture", e))?;
        }

        let mut unresolved = Vec::new();
        for rule in profile.rules() {
            let Ok(syscall) = ScmpSyscall::from_name(rule.syscall.as_str()) else {
                tracing::warn!(
                    syscall = %rule.syscall,
                    "syscall unknown to libseccomp, not allowed"
                );
                unresolved.push(rule.syscall.clone());
                continue;
            };
            ctx.add_rule(ScmpAction::Allow, syscall)
                .map_err(|e| seccomp_err(rule.syscall.as_str(), e))?;
        }

        let program = export(&ctx)?;
        tracing::info!(
            version = profile.version(),
            default_action = %profile.default_action(),
            rules = profile.rules().len() - unresolved.len(),
            instructions = program.len(),
            "compiled seccomp filter"
        );
        Ok(Self {
            program,
            unresolved,
        })
    }

    /// Number of BPF instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.program.len()
    }

    /// Returns `true` if the program has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    /// Profile rules that were left out because this host does not know them.
    #[must_use]
    pub fn unresolved(&self) -> &[SyscallName] {
        &self.unresolved
    }

    /// Installs the filter on the calling thread, after setting
    /// `no_new_privs`.
    ///
    /// Meant for the child between `fork` and `exec`: it does not allocate.
    ///
    /// # Errors
    ///
    /// Returns the OS error of the failing call.
    pub fn install(&self) -> std::io::Result<()> {
        let len = u16::try_from(self.program.len())
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;
        let prog = libc::sock_fprog {
            len,
            filter: self.program.as_ptr().cast_mut(),
        };
        // SAFETY: plain prctl with integer arguments.
        if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: `prog` points at `self.program`, which outlives the call;
        // the kernel copies the program before returning.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                libc::SECCOMP_SET_MODE_FILTER,
                0,
                std::ptr::from_ref(&prog),
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Exports the context as raw BPF through a temporary file.
fn export(ctx: &ScmpFilterContext) -> Result<Vec<libc::sock_filter>> {
    let mut file = tempfile::tempfile().map_err(|e| seccomp_err("creating export file", e))?;
    ctx.export_bpf(&mut file)
        .map_err(|e| seccomp_err("exporting BPF", e))?;
    let _ = file
        .seek(SeekFrom::Start(0))
        .map_err(|e| seccomp_err("rewinding export file", e))?;
    let mut raw = Vec::new();
    let _ = file
        .read_to_end(&mut raw)
        .map_err(|e| seccomp_err("reading export file", e))?;
    decode(&raw)
}

fn decode(raw: &[u8]) -> Result<Vec<libc::sock_filter>> {
    if raw.len() % INSN_LEN != 0 {
        return Err(seccomp_err(
            "exported BPF",
            format!("{} bytes is not a whole number of instructions", raw.len()),
        ));
    }
    let program: Vec<libc::sock_filter> = raw
        .chunks_exact(INSN_LEN)
        .map(|insn| libc::sock_filter {
            code: u16::from_ne_bytes([insn[0], insn[1]]),
            jt: insn[2],
            jf: insn[3],
            k: u32::from_ne_bytes([insn[4], insn[5], insn[6], insn[7]]),
        })
        .collect();
    if program.is_empty() || program.len() > MAX_INSNS {
        return Err(seccomp_err(
            "exported BPF",
            format!("{} instructions (kernel accepts 1..={MAX_INSNS})", program.len()),
        ));
    }
    Ok(program)
}
