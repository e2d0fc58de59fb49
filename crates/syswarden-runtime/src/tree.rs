//! The set of processes started under one launch.
//!
//! Workers forked by the supervised process inherit its filter, and a
//! worker's policy kill shows up only in the audit trail. Deciding whether
//! an audit record belongs to this launch:
//!
//! - the pid was seen as a descendant while it was alive, or
//! - it is alive now and its parent chain reaches the root, or
//! - it is already gone and carries this launch's audit session. The
//!   session id is inherited across fork and cannot be changed without
//!   `CAP_AUDIT_CONTROL`.

use std::collections::BTreeSet;
use std::path::Path;

use crate::audit::AuditRecord;

/// Parent chains longer than this are treated as foreign.
const MAX_DEPTH: usize = 128;

/// Descendants of one supervised root.
#[derive(Debug, Clone)]
pub struct ProcessTree {
    root: u32,
    seen: BTreeSet<u32>,
    session: Option<u32>,
}

impl ProcessTree {
    /// Tracks the descendants of `root`, which shares this process's audit
    /// session.
    #[must_use]
    pub fn new(root: u32) -> Self {
        Self {
            root,
            seen: BTreeSet::new(),
            session: read_session(Path::new("/proc/self/sessionid")),
        }
    }

    /// Root pid.
    #[must_use]
    pub const fn root(&self) -> u32 {
        self.root
    }

    /// Pids seen below the root so far.
    #[must_use]
    pub const fn seen(&self) -> &BTreeSet<u32> {
        &self.seen
    }

    /// Records every process currently below the root.
    pub fn refresh(&mut self) {
        let mut stack = children(self.root);
        while let Some(pid) = stack.pop() {
            if self.seen.insert(pid) {
                tracing::trace!(root = self.root, pid, "new descendant");
            }
            stack.extend(children(pid));
        }
    }

    /// Returns `true` if `record` is about a process of this launch.
    #[must_use]
    pub fn owns(&self, record: &AuditRecord) -> bool {
        if record.pid == self.root || self.seen.contains(&record.pid) {
            return true;
        }
        match descends_from(record.pid, self.root) {
            Some(owned) => owned,
            None => self.session.is_some() && record.session == self.session,
        }
    }
}

/// Direct children of every thread of `pid`.
fn children(pid: u32) -> Vec<u32> {
    let Ok(tasks) = std::fs::read_dir(format!("/proc/{pid}/task")) else {
        return Vec::new();
    };
    tasks
        .filter_map(|task| std::fs::read_to_string(task.ok()?.path().join("children")).ok())
        .flat_map(|list| {
            list.split_whitespace()
                .filter_map(|p| p.parse().ok())
                .collect::<Vec<u32>>()
        })
        .collect()
}

/// Parent pid from `/proc/<pid>/stat`; the command name may contain spaces
/// and parentheses, so fields are read after the last `)`.
fn parent(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (_, fields) = stat.rsplit_once(')')?;
    fields.split_whitespace().nth(1)?.parse().ok()
}

/// `None` when `pid` no longer exists.
fn descends_from(pid: u32, root: u32) -> Option<bool> {
    let mut current = parent(pid)?;
    for _ in 0..MAX_DEPTH {
        if current == root {
            return Some(true);
        }
        if current <= 1 {
            return Some(false);
        }
        match parent(current) {
            Some(next) => current = next,
            None => return Some(false),
        }
    }
    Some(false)
}

fn read_session(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};

    use super::*;

    fn record(pid: u32, session: Option<u32>) -> AuditRecord {
        AuditRecord {
            pid,
            syscall_nr: 63,
            arch: None,
            signal: Some(libc::SIGSYS),
            code: None,
            session,
            timestamp: None,
        }
    }

    /// Above the kernel's pid limit, so never a live process.
    const GONE: u32 = 4_194_305;

    #[test]
    fn finds_grandchildren() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 5 & wait"])
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sh");
        let mut tree = ProcessTree::new(child.id());
        let deadline = Instant::now() + Duration::from_secs(2);
        while tree.seen().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
            tree.refresh();
        }
        let worker = tree.seen().iter().next().copied();
        child.kill().unwrap();
        let _ = child.wait();

        let worker = worker.expect("sleep was never seen");
        assert!(tree.owns(&record(worker, None)));
        assert!(tree.owns(&record(tree.root(), None)));
    }

    #[test]
    fn live_foreign_process_is_not_owned() {
        let tree = ProcessTree::new(GONE);
        let me = std::process::id();
        // Same session, but alive and not below the root.
        assert!(!tree.owns(&record(me, tree.session)));
    }

    #[test]
    fn gone_process_is_matched_by_session() {
        let mut tree = ProcessTree::new(GONE);
        tree.session = Some(7);
        assert!(tree.owns(&record(GONE + 1, Some(7))));
        assert!(!tree.owns(&record(GONE + 1, Some(8))));
        assert!(!tree.owns(&record(GONE + 1, None)));
        tree.session = None;
        assert!(!tree.owns(&record(GONE + 1, Some(7))));
    }

    #[test]
    fn parent_of_self_is_read() {
        let me = std::process::id();
        assert_eq!(parent(me), Some(std::os::unix::process::parent_id()));
        assert_eq!(descends_from(me, std::os::unix::process::parent_id()), Some(true));
        assert_eq!(descends_from(GONE, 1), None);
    }

    #[test]
    fn session_file_is_parsed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessionid");
        std::fs::write(&path, "4294967295").unwrap();
        assert_eq!(read_session(&path), Some(u32::MAX));
        assert_eq!(read_session(&dir.path().join("missing")), None);
    }
}
