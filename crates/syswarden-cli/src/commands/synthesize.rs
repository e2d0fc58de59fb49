//! `swd synthesize` — Build a filter profile from a usage set.

use std::path::PathBuf;

use clap::Args;
use syswarden_common::config::SyswardenConfig;
use syswarden_common::error::SyswardenError;
use syswarden_profile::diff::diff;
use syswarden_profile::filter::{DefaultAction, FilterProfile};
use syswarden_profile::synthesizer::{SynthesisOptions, Synthesizer};
use syswarden_profile::usage::SyscallUsageSet;

use crate::output::{BOLD, DIM, GREEN, RESET};

/// Arguments for the `synthesize` command.
#[derive(Args, Debug)]
pub struct SynthesizeArgs {
    /// Usage set produced by `swd trace` or `swd merge`.
    pub usage: PathBuf,

    /// Where the filter profile is written.
    #[arg(short, long, default_value = "profile.json")]
    pub out: PathBuf,

    /// Profile this one replaces; its version is incremented.
    #[arg(long)]
    pub previous: Option<PathBuf>,

    /// Default action: kill-process, errno or log (overrides the configuration).
    #[arg(long)]
    pub default_action: Option<String>,

    /// Errno returned by the errno action.
    #[arg(long)]
    pub errno: Option<u16>,

    /// Freeze a usage set below the configured minimum anyway.
    #[arg(long)]
    pub allow_incomplete: bool,
}

impl SynthesizeArgs {
    fn options(&self, config: &SyswardenConfig) -> anyhow::Result<SynthesisOptions> {
        let mut options =
            SynthesisOptions::try_from(&config.synthesis).map_err(|e| anyhow::anyhow!("{e}"))?;
        if self.default_action.is_some() || self.errno.is_some() {
            let name = self
                .default_action
                .as_deref()
                .unwrap_or(&config.synthesis.default_action);
            let errno = self.errno.unwrap_or(config.synthesis.errno_ret);
            options.default_action =
                DefaultAction::from_config(name, errno).map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        options.allow_incomplete = self.allow_incomplete;
        Ok(options)
    }
}

/// Executes the `synthesize` command.
///
/// # Errors
///
/// Returns an error if the usage set is incomplete and not confirmed, or a
/// file cannot be read or written.
pub fn execute(args: SynthesizeArgs, config: &SyswardenConfig) -> anyhow::Result<()> {
    let options = args.options(config)?;
    let usage = SyscallUsageSet::load(&args.usage).map_err(|e| anyhow::anyhow!("{e}"))?;
    let previous = args
        .previous
        .as_deref()
        .map(FilterProfile::load)
        .transpose()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let profile = Synthesizer::new(options)
        .synthesize(&usage, previous.as_ref())
        .map_err(|e| match e {
            SyswardenError::ProfileGenerationIncomplete { .. } => {
                anyhow::anyhow!("{e}\nRe-run with --allow-incomplete to freeze it anyway.")
            }
            other => anyhow::anyhow!("{other}"),
        })?;
    profile
        .save(&args.out)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    eprintln!();
    eprintln!(
        "  {GREEN}✓{RESET} {BOLD}v{}{RESET}: {} allowed syscalls, default {}",
        profile.version(),
        profile.rules().len(),
        profile.default_action()
    );
    if let Some(previous) = &previous {
        print!("{}", diff(previous, &profile));
    }
    eprintln!("  {DIM}written to {}{RESET}", args.out.display());
    Ok(())
}
