//! `swd launch` — Run a program confined by a policy bundle.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Args;
use syswarden_common::config::SyswardenConfig;
use syswarden_policy::store::BundleStore;
use syswarden_runtime::launcher::Launcher;

use crate::output::{BOLD, CYAN, DIM, RED, RESET, format_timestamp, short_hash};

/// Arguments for the `launch` command.
#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Bundle directory.
    pub bundle: PathBuf,

    /// Do not append violations to the violation log.
    #[arg(long)]
    pub no_log: bool,

    /// Program and arguments to run.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `launch` command.
///
/// Exits with the program's exit code, `128 + signal` if it was killed, or
/// `128 + SIGSYS` on a policy kill.
///
/// # Errors
///
/// Returns an error if the bundle fails verification, the executable does
/// not match the bundle target, or the program cannot be started under the
/// policy.
pub fn execute(args: LaunchArgs, config: &SyswardenConfig) -> anyhow::Result<()> {
    let Some((program, program_args)) = args.command.split_first() else {
        anyhow::bail!("Nothing to launch.\nUse: swd launch <bundle-dir> -- <program> [args]");
    };
    let bundle = BundleStore::new(&args.bundle)
        .load()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut launcher = Launcher::new(&config.launch);
    if args.no_log {
        launcher = launcher.with_violation_log(None);
    }

    // The terminal delivers Ctrl+C to the child as well; keep supervising.
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .map_err(|e| anyhow::anyhow!("Failed to set Ctrl+C handler: {e}"))?;

    let process = launcher
        .launch(&bundle, PathBuf::from(program).as_path(), program_args)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    eprintln!(
        "  {DIM}launched {} (pid {}) under bundle {}{RESET}",
        process.executable().display(),
        process.pid(),
        short_hash(bundle.checksum().as_hex())
    );

    // Ends when the monitor is done, after workers' kills are reported too.
    let mut violations = 0usize;
    for record in process.violations() {
        violations += 1;
        eprintln!(
            "  {RED}✗ policy violation{RESET} {BOLD}{}{RESET} pid {} at {}",
            record.syscall_label(),
            record.pid,
            format_timestamp(&record.timestamp)
        );
    }

    let outcome = process.wait().map_err(|e| anyhow::anyhow!("{e}"))?;
    if interrupted.load(Ordering::SeqCst) {
        eprintln!("  {DIM}interrupted{RESET}");
    }
    if violations > 0 {
        eprintln!("  {CYAN}swd merge --hints{RESET} turns recorded violations into hints");
    }
    tracing::info!(%outcome, "confined process finished");

    let code = outcome.exit_code();
    if code == 0 {
        return Ok(());
    }
    eprintln!("  {DIM}{outcome}{RESET}");
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use syswarden_common::types::Sha256Hash;
    use syswarden_runtime::monitor::{ExitOutcome, SIGSYS};
    use syswarden_runtime::violations::ViolationRecord;

    #[test]
    fn exit_codes_follow_shell_conventions() {
        assert_eq!(ExitOutcome::Exited(0).exit_code(), 0);
        assert_eq!(ExitOutcome::Exited(3).exit_code(), 3);
        assert_eq!(ExitOutcome::Signaled(9).exit_code(), 137);

        let kill = ExitOutcome::PolicyViolation(ViolationRecord {
            checksum: Sha256Hash::from_hex("e".repeat(64)).unwrap(),
            syscall: None,
            syscall_nr: Some(165),
            pid: 1,
            timestamp: Utc::now(),
        });
        assert_eq!(kill.exit_code(), 128 + SIGSYS);
    }
}
