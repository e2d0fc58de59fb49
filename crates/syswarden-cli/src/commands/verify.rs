//! `swd verify` — Check a bundle's checksum, and optionally its target.

use std::path::PathBuf;

use clap::Args;
use syswarden_policy::store::BundleStore;
use syswarden_runtime::launcher::{check_target, resolve_executable};

use crate::output::{GREEN, RESET};

/// Arguments for the `verify` command.
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Bundle directory.
    pub bundle: PathBuf,

    /// Also check this executable against the bundle's target digest.
    #[arg(long)]
    pub executable: Option<PathBuf>,
}

/// Executes the `verify` command.
///
/// # Errors
///
/// Returns an error if the checksum does not match, the executable differs
/// from the bundle's target, or the bundle cannot be read.
pub fn execute(args: VerifyArgs) -> anyhow::Result<()> {
    let store = BundleStore::new(&args.bundle);
    let checksum = store.verify().map_err(|e| anyhow::anyhow!("{e}"))?;

    if let Some(executable) = &args.executable {
        let bundle = store.load().map_err(|e| anyhow::anyhow!("{e}"))?;
        let executable = resolve_executable(executable).map_err(|e| anyhow::anyhow!("{e}"))?;
        check_target(bundle.target(), &executable).map_err(|e| anyhow::anyhow!("{e}"))?;
        eprintln!("  {GREEN}✓{RESET} {} matches the bundle target", executable.display());
    }
    eprintln!("  {GREEN}✓{RESET} bundle checksum verified");
    println!("{checksum}");
    Ok(())
}
