//! Violation records and the JSON-lines violation log.
//!
//! One line per policy kill. The log is append-only; the aggregator reads it
//! back as hints for the next synthesis iteration.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use syswarden_common::error::{Result, SyswardenError};
use syswarden_common::types::{Sha256Hash, SyscallName};

/// A kernel-enforced policy kill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Checksum of the bundle the process ran under.
    pub checksum: Sha256Hash,
    /// Offending syscall, when the audit trail named a known one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syscall: Option<SyscallName>,
    /// Raw syscall number from the audit record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syscall_nr: Option<i64>,
    /// Process that was killed.
    pub pid: u32,
    /// When the kill was observed.
    pub timestamp: DateTime<Utc>,
}

impl ViolationRecord {
    /// The syscall as shown to operators: its name, `syscall_<nr>`, or
    /// `unknown` without an audit record.
    #[must_use]
    pub fn syscall_label(&self) -> String {
        match (&self.syscall, self.syscall_nr) {
            (Some(name), _) => name.to_string(),
            (None, Some(nr)) => format!("syscall_{nr}"),
            (None, None) => "unknown".into(),
        }
    }
}

/// Append-only log of [`ViolationRecord`]s, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationLog {
    path: PathBuf,
}

impl ViolationLog {
    /// Refers to the log at `path`; the file is created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record.
    ///
    /// Creates the parent directory and the file if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created or written.
    pub fn append(&self, record: &ViolationRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyswardenError::io(parent, e))?;
        }
        let line = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SyswardenError::io(&self.path, e))?;
        writeln!(file, "{line}").map_err(|e| SyswardenError::io(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), pid = record.pid, "violation recorded");
        Ok(())
    }

    /// Reads every record.
    ///
    /// Returns an empty list if the log does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, or a line is
    /// not a valid record.
    pub fn read(&self) -> Result<Vec<ViolationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw =
            std::fs::read_to_string(&self.path).map_err(|e| SyswardenError::io(&self.path, e))?;
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|e| SyswardenError::Parse {
                    what: "violation log",
                    message: format!("line {}: {e}", idx + 1),
                })
            })
            .collect()
    }

    /// Named syscalls from records of the given bundle, or of every bundle
    /// when `checksum` is `None`.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub fn hints(&self, checksum: Option<&Sha256Hash>) -> Result<BTreeSet<SyscallName>> {
        Ok(self
            .read()?
            .into_iter()
            .filter(|r| checksum.is_none_or(|c| &r.checksum == c))
            .filter_map(|r| r.syscall)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(syscall: Option<&str>, nr: Option<i64>, checksum: &str) -> ViolationRecord {
        ViolationRecord {
            checksum: Sha256Hash::from_hex(checksum.repeat(64)).unwrap(),
            syscall: syscall.map(|s| SyscallName::new(s).unwrap()),
            syscall_nr: nr,
            pid: 4242,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn read_missing_log_returns_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = ViolationLog::new(dir.path().join("violations.jsonl"));
        assert!(log.read().unwrap().is_empty());
    }

    #[test]
    fn append_and_read_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = ViolationLog::new(dir.path().join("nested").join("violations.jsonl"));
        let a = record(Some("ptrace"), Some(101), "a");
        let b = record(None, None, "b");
        log.append(&a).unwrap();
        log.append(&b).unwrap();

        assert_eq!(log.read().unwrap(), vec![a, b]);
    }

    #[test]
    fn hints_filter_by_bundle_and_skip_unnamed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = ViolationLog::new(dir.path().join("violations.jsonl"));
        log.append(&record(Some("ptrace"), Some(101), "a")).unwrap();
        log.append(&record(Some("mount"), Some(165), "b")).unwrap();
        log.append(&record(None, Some(999), "a")).unwrap();

        let only_a = Sha256Hash::from_hex("a".repeat(64)).unwrap();
        let hints = log.hints(Some(&only_a)).unwrap();
        assert_eq!(hints.len(), 1);
        assert!(hints.contains(&SyscallName::new("ptrace").unwrap()));
        assert_eq!(log.hints(None).unwrap().len(), 2);
    }

    #[test]
    fn corrupt_line_reports_line_number() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("violations.jsonl");
        let log = ViolationLog::new(&path);
        log.append(&record(Some("ptrace"), Some(101), "a")).unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        let err = log.read().unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn syscall_label_falls_back() {
        assert_eq!(record(Some("ptrace"), Some(101), "a").syscall_label(), "ptrace");
        assert_eq!(record(None, Some(999), "a").syscall_label(), "syscall_999");
        assert_eq!(record(None, None, "a").syscall_label(), "unknown");
    }
}
