//! `swd minimize` — Drop allowed syscalls the workload does not need.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use syswarden_common::config::SyswardenConfig;
use syswarden_common::types::TargetIdentity;
use syswarden_policy::store::BundleStore;
use syswarden_profile::minimize::minimize;
use syswarden_runtime::launcher::Launcher;
use syswarden_runtime::probe::LaunchProbe;
use syswarden_trace::scenario::IdleScenario;

use super::{ScenarioArgs, app_roots};
use crate::output::{BOLD, DIM, GREEN, RESET, join_names};

/// Arguments for the `minimize` command.
#[derive(Args, Debug)]
pub struct MinimizeArgs {
    /// Bundle whose filter profile is minimized.
    pub bundle: PathBuf,

    /// Where the minimized filter profile is written.
    #[arg(short, long, default_value = "profile.min.json")]
    pub out: PathBuf,

    /// Also write the minimization report as JSON.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Milliseconds the target gets to start before the workload runs.
    #[arg(long, default_value_t = 500)]
    pub startup_grace: u64,

    /// Directory every path rule must lie within (repeatable).
    #[arg(long = "app-root")]
    pub app_roots: Vec<PathBuf>,

    #[command(flatten)]
    pub scenario: ScenarioArgs,

    /// Arguments passed to the bundle's executable.
    #[arg(last = true)]
    pub args: Vec<String>,
}

/// Executes the `minimize` command.
///
/// Every probe launches the real target, so this takes one run per
/// observed syscall in the profile.
///
/// # Errors
///
/// Returns an error if the bundle cannot be loaded, a probe cannot be run,
/// or the result cannot be written.
pub fn execute(args: MinimizeArgs, config: &SyswardenConfig) -> anyhow::Result<()> {
    let roots = app_roots(&args.app_roots, config)?;
    let bundle = BundleStore::new(&args.bundle)
        .load()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let scenario = match args.scenario.driver()? {
        Some(driver) => driver,
        None => Arc::new(IdleScenario::new(Duration::ZERO)),
    };
    let target: TargetIdentity = bundle.target().clone();

    eprintln!();
    eprintln!(
        "  {BOLD}Minimizing{RESET} v{} for {} ({} rules)",
        bundle.filter().version(),
        target,
        bundle.filter().rules().len()
    );

    let mut probe = LaunchProbe::new(
        Launcher::new(&config.launch),
        target,
        args.args.clone(),
        bundle.paths().clone(),
        roots,
        scenario,
    )
    .with_startup_grace(Duration::from_millis(args.startup_grace));
    let (profile, report) =
        minimize(bundle.filter(), &mut probe).map_err(|e| anyhow::anyhow!("{e}"))?;

    profile
        .save(&args.out)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    if let Some(path) = &args.report {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", path.display()))?;
    }

    eprintln!(
        "  {GREEN}✓{RESET} v{}: removed {} of {} candidates in {} probes",
        profile.version(),
        report.removed.len(),
        report.removed.len() + report.necessary.len(),
        report.probes
    );
    eprintln!("  {DIM}removed: {}{RESET}", join_names(&report.removed));
    eprintln!("  {DIM}written to {}{RESET}", args.out.display());
    Ok(())
}
