//! `swd violations` — List policy violations recorded by the launcher.

use std::path::PathBuf;

use clap::Args;
use syswarden_common::config::SyswardenConfig;
use syswarden_common::types::Sha256Hash;
use syswarden_runtime::violations::{ViolationLog, ViolationRecord};

use crate::output::{BOLD, RESET, format_timestamp, short_hash};

/// Arguments for the `violations` command.
#[derive(Args, Debug)]
pub struct ViolationsArgs {
    /// Violation log (defaults to the configured one).
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Only show records for this bundle checksum.
    #[arg(long)]
    pub checksum: Option<String>,

    /// Print records as JSON lines.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `violations` command.
///
/// # Errors
///
/// Returns an error if the log cannot be read or the checksum is invalid.
pub fn execute(args: ViolationsArgs, config: &SyswardenConfig) -> anyhow::Result<()> {
    let log = ViolationLog::new(args.log.unwrap_or_else(|| config.launch.violation_log.clone()));
    let checksum = args
        .checksum
        .map(Sha256Hash::from_hex)
        .transpose()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let records = filter(
        log.read().map_err(|e| anyhow::anyhow!("{e}"))?,
        checksum.as_ref(),
    );

    if args.json {
        for record in &records {
            println!("{}", serde_json::to_string(record)?);
        }
        return Ok(());
    }
    if records.is_empty() {
        println!("No violations recorded in {}", log.path().display());
        return Ok(());
    }

    println!(
        "{BOLD}{:<20} {:>8}  {:<20} {:<12}{RESET}",
        "TIME", "PID", "SYSCALL", "BUNDLE"
    );
    for record in &records {
        println!(
            "{:<20} {:>8}  {:<20} {:<12}",
            format_timestamp(&record.timestamp),
            record.pid,
            record.syscall_label(),
            short_hash(record.checksum.as_hex())
        );
    }
    Ok(())
}

fn filter(records: Vec<ViolationRecord>, checksum: Option<&Sha256Hash>) -> Vec<ViolationRecord> {
    records
        .into_iter()
        .filter(|r| checksum.is_none_or(|c| &r.checksum == c))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use syswarden_common::types::SyscallName;

    use super::*;

    fn record(checksum: char, syscall: &str) -> ViolationRecord {
        ViolationRecord {
            checksum: Sha256Hash::from_hex(checksum.to_string().repeat(64)).unwrap(),
            syscall: Some(SyscallName::new(syscall).unwrap()),
            syscall_nr: None,
            pid: 7,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn checksum_filter_keeps_matching_records() {
        let records = vec![record('a', "ptrace"), record('b', "mount")];
        let wanted = Sha256Hash::from_hex("b".repeat(64)).unwrap();

        let kept = filter(records.clone(), Some(&wanted));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].syscall_label(), "mount");
        assert_eq!(filter(records, None).len(), 2);
    }
}
