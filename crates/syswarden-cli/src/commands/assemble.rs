//! `swd assemble` — Bind a filter profile, a path profile and a target into a bundle.

use std::path::PathBuf;

use clap::Args;
use syswarden_common::config::SyswardenConfig;
use syswarden_common::types::TargetIdentity;
use syswarden_policy::bundle::assemble;
use syswarden_policy::checksum::hash_file;
use syswarden_policy::paths::PathPermissionProfile;
use syswarden_policy::store::BundleStore;
use syswarden_profile::filter::FilterProfile;
use syswarden_runtime::launcher::resolve_executable;

use super::app_roots;
use crate::output::{BOLD, DIM, GREEN, RESET, YELLOW};

/// Arguments for the `assemble` command.
#[derive(Args, Debug)]
pub struct AssembleArgs {
    /// Filter profile.
    #[arg(long)]
    pub filter: PathBuf,

    /// Path-permission profile, JSON or text lines. Omit to leave the
    /// filesystem unconfined.
    #[arg(long)]
    pub paths: Option<PathBuf>,

    /// Executable the bundle is built for.
    #[arg(long)]
    pub executable: PathBuf,

    /// Target name (defaults to the executable's file name).
    #[arg(long)]
    pub name: Option<String>,

    /// Do not pin the executable's SHA-256 digest.
    #[arg(long)]
    pub no_digest: bool,

    /// Directory every path rule must lie within (repeatable).
    #[arg(long = "app-root")]
    pub app_roots: Vec<PathBuf>,

    /// Bundle directory to write.
    #[arg(short, long)]
    pub out: PathBuf,
}

/// Executes the `assemble` command.
///
/// # Errors
///
/// Returns an error if a path rule escapes the application roots, an input
/// cannot be read, or the bundle cannot be written.
pub fn execute(args: AssembleArgs, config: &SyswardenConfig) -> anyhow::Result<()> {
    let roots = app_roots(&args.app_roots, config)?;
    let filter = FilterProfile::load(&args.filter).map_err(|e| anyhow::anyhow!("{e}"))?;
    let paths = match &args.paths {
        Some(path) => PathPermissionProfile::load(path).map_err(|e| anyhow::anyhow!("{e}"))?,
        None => PathPermissionProfile::default(),
    };

    let executable = resolve_executable(&args.executable).map_err(|e| anyhow::anyhow!("{e}"))?;
    let name = args.name.clone().unwrap_or_else(|| {
        executable
            .file_name()
            .map_or_else(|| executable.display().to_string(), |n| n.to_string_lossy().into_owned())
    });
    let mut target = TargetIdentity::new(name, &executable);
    if !args.no_digest {
        target = target.with_digest(hash_file(&executable).map_err(|e| anyhow::anyhow!("{e}"))?);
    }

    let bundle = assemble(&filter, &paths, target, &roots).map_err(|e| anyhow::anyhow!("{e}"))?;
    BundleStore::new(&args.out)
        .write(&bundle)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    eprintln!();
    eprintln!(
        "  {GREEN}✓{RESET} bundle for {BOLD}{}{RESET} written to {}",
        bundle.target(),
        args.out.display()
    );
    eprintln!(
        "  {DIM}filter v{}, {} path rules{RESET}",
        filter.version(),
        paths.rules.len()
    );
    if paths.is_empty() {
        eprintln!("  {YELLOW}!{RESET} no path rules: filesystem access will not be confined");
    }
    println!("{}", bundle.checksum());
    Ok(())
}
