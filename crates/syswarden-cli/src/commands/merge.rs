//! `swd merge` — Merge usage sets, recordings and violation hints.

use std::path::PathBuf;

use clap::Args;
use syswarden_common::config::SyswardenConfig;
use syswarden_common::types::{Sha256Hash, SyscallName};
use syswarden_profile::aggregator::Aggregator;
use syswarden_profile::usage::SyscallUsageSet;
use syswarden_runtime::violations::ViolationLog;
use syswarden_trace::event::TraceRecording;

use crate::output::{BOLD, DIM, GREEN, RESET, YELLOW, format_percent, join_names};

/// Arguments for the `merge` command.
#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Aggregator state file; created if missing.
    #[arg(long)]
    pub state: PathBuf,

    /// Target name used when the state file is created.
    #[arg(long, default_value = "unnamed")]
    pub target: String,

    /// Usage set files to merge.
    #[arg(long = "usage")]
    pub usage: Vec<PathBuf>,

    /// Raw trace recordings to merge.
    #[arg(long = "recording")]
    pub recordings: Vec<PathBuf>,

    /// Load violation records as pending hints.
    #[arg(long)]
    pub hints: bool,

    /// Only take hints from processes launched under this bundle checksum.
    #[arg(long, requires = "hints")]
    pub checksum: Option<String>,

    /// Violation log to read hints from (defaults to the configured one).
    #[arg(long)]
    pub violation_log: Option<PathBuf>,

    /// Accept a pending hint into the usage set.
    #[arg(long = "accept", value_name = "SYSCALL")]
    pub accept: Vec<String>,

    /// Accept every pending hint.
    #[arg(long, conflicts_with = "accept")]
    pub accept_all: bool,

    /// Write the frozen usage set here.
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

/// Executes the `merge` command.
///
/// # Errors
///
/// Returns an error if an input cannot be read, a named hint is not
/// pending, or the state cannot be written.
pub fn execute(args: MergeArgs, config: &SyswardenConfig) -> anyhow::Result<()> {
    let mut aggregator = if args.state.exists() {
        Aggregator::load(&args.state).map_err(|e| anyhow::anyhow!("{e}"))?
    } else {
        Aggregator::new(args.target.clone())
    };

    for path in &args.usage {
        let usage = SyscallUsageSet::load(path).map_err(|e| anyhow::anyhow!("{e}"))?;
        let run = aggregator.ingest(path.display().to_string(), &usage);
        report_run(run.run, &run.label, run.discovered.len(), run.delta);
    }
    for path in &args.recordings {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
        let recording: TraceRecording = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid recording {}: {e}", path.display()))?;
        let run = aggregator.ingest(path.display().to_string(), &recording);
        report_run(run.run, &run.label, run.discovered.len(), run.delta);
    }

    if args.hints {
        let log = ViolationLog::new(
            args.violation_log
                .clone()
                .unwrap_or_else(|| config.launch.violation_log.clone()),
        );
        let checksum = args
            .checksum
            .map(Sha256Hash::from_hex)
            .transpose()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let hints = log.hints(checksum.as_ref()).map_err(|e| anyhow::anyhow!("{e}"))?;
        for syscall in hints {
            aggregator.ingest_violation(syscall);
        }
    }

    let accepted: Vec<SyscallName> = if args.accept_all {
        aggregator.hints().iter().cloned().collect()
    } else {
        args.accept
            .iter()
            .map(|name| SyscallName::new(name.as_str()))
            .collect::<Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("{e}"))?
    };
    for syscall in &accepted {
        aggregator
            .accept_hint(syscall)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    aggregator
        .save(&args.state)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    eprintln!();
    eprintln!(
        "  {BOLD}{}{RESET}: {} syscalls after {} runs",
        aggregator.target(),
        aggregator.usage().len(),
        aggregator.runs().len()
    );
    if !accepted.is_empty() {
        eprintln!("  {GREEN}✓{RESET} accepted: {}", join_names(&accepted));
    }
    if !aggregator.hints().is_empty() {
        eprintln!(
            "  {YELLOW}!{RESET} pending hints: {}",
            join_names(aggregator.hints())
        );
        eprintln!("  {DIM}accept with --accept <SYSCALL> or --accept-all{RESET}");
    }

    if let Some(out) = &args.out {
        aggregator
            .freeze()
            .save(out)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        eprintln!("  {DIM}usage set written to {}{RESET}", out.display());
    }
    Ok(())
}

fn report_run(run: usize, label: &str, discovered: usize, delta: f64) {
    eprintln!(
        "  run {run} {DIM}{label}{RESET}: {discovered} new, coverage delta {}",
        format_percent(delta)
    );
}
