//! `swd diff` — Compare two filter profiles.

use std::path::PathBuf;

use clap::Args;
use syswarden_profile::diff::diff;
use syswarden_profile::filter::FilterProfile;

/// Arguments for the `diff` command.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Older profile.
    pub old: PathBuf,

    /// Newer profile.
    pub new: PathBuf,

    /// Print the difference as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `diff` command.
///
/// # Errors
///
/// Returns an error if either profile cannot be loaded.
pub fn execute(args: DiffArgs) -> anyhow::Result<()> {
    let old = FilterProfile::load(&args.old).map_err(|e| anyhow::anyhow!("{e}"))?;
    let new = FilterProfile::load(&args.new).map_err(|e| anyhow::anyhow!("{e}"))?;
    let changes = diff(&old, &new);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&changes)?);
    } else if changes.is_empty() {
        println!("No changes between v{} and v{}", old.version(), new.version());
    } else {
        print!("{changes}");
    }
    Ok(())
}
