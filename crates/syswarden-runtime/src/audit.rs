//! Kernel audit trail lookups.
//!
//! A seccomp kill is logged by the kernel as a `SECCOMP` (type 1326) audit
//! record:
//!
//! ```text
//! type=SECCOMP msg=audit(1700000000.123:456): auid=1000 uid=1000 gid=1000
//!   ses=2 pid=4242 comm="server" exe="/srv/app/server" sig=31
//!   arch=c000003e syscall=101 compat=0 ip=0x7f3a code=0x80000000
//! ```
//!
//! With `auditd` running the record lands in the audit log; otherwise it is
//! in the kernel ring buffer. Both hold history from earlier runs and from
//! unrelated processes, so a launch follows them from their current end and
//! only accepts kill records stamped after it started.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use syswarden_common::config::LaunchConfig;
use syswarden_common::error::{Result, SyswardenError};

/// Kernel ring buffer device.
pub const KMSG: &str = "/dev/kmsg";

/// The fields of a seccomp audit record syswarden uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Process the record is about.
    pub pid: u32,
    /// Native syscall number.
    pub syscall_nr: i64,
    /// Audit architecture token, e.g. `c000003e` for x86-64.
    pub arch: Option<String>,
    /// Signal delivered, when the action was a kill.
    pub signal: Option<i32>,
    /// Seccomp action that fired (`code=`).
    pub code: Option<u32>,
    /// Audit session of the process (`ses=`), inherited across fork.
    pub session: Option<u32>,
    /// When the kernel logged the record, from `audit(<secs>.<millis>:<serial>)`.
    pub timestamp: Option<DateTime<Utc>>,
}

impl AuditRecord {
    /// Returns `true` if the record describes a kill-process or
    /// kill-thread action.
    ///
    /// A trap action is also logged with `sig=31`, so the action code is
    /// authoritative when present.
    #[must_use]
    pub fn is_kill(&self) -> bool {
        match self.code {
            Some(code) => matches!(
                code & libc::SECCOMP_RET_ACTION_FULL,
                libc::SECCOMP_RET_KILL_PROCESS | libc::SECCOMP_RET_KILL_THREAD
            ),
            None => self.signal == Some(libc::SIGSYS),
        }
    }

    /// Returns `true` if the record was logged at or after `since`.
    ///
    /// Audit stamps carry milliseconds, so `since` is compared at that
    /// resolution. Unstamped records are never recent.
    #[must_use]
    pub fn is_since(&self, since: DateTime<Utc>) -> bool {
        self.timestamp
            .is_some_and(|t| t.timestamp_millis() >= since.timestamp_millis())
    }
}

/// Parses one audit line. Returns `None` for anything but a seccomp record
/// with a pid and a syscall number.
#[must_use]
pub fn parse_line(line: &str) -> Option<AuditRecord> {
    let mut is_seccomp = false;
    let mut pid = None;
    let mut syscall_nr = None;
    let mut arch = None;
    let mut signal = None;
    let mut code = None;
    let mut session = None;
    for token in line.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "type" => is_seccomp = value == "SECCOMP" || value == "1326",
            "pid" => pid = value.parse().ok(),
            "syscall" => syscall_nr = value.parse().ok(),
            "arch" => arch = Some(value.to_owned()),
            "sig" => signal = value.parse().ok(),
            "ses" => session = value.parse().ok(),
            "code" => {
                code = value
                    .strip_prefix("0x")
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok());
            }
            _ => {}
        }
    }
    if !is_seccomp {
        return None;
    }
    Some(AuditRecord {
        pid: pid?,
        syscall_nr: syscall_nr?,
        arch,
        signal,
        code,
        session,
        timestamp: parse_stamp(line),
    })
}

/// Reads the `audit(1700000000.123:456)` stamp.
fn parse_stamp(line: &str) -> Option<DateTime<Utc>> {
    let rest = &line[line.find("audit(")? + "audit(".len()..];
    let (stamp, _serial) = rest.split_once(':')?;
    let (secs, millis) = stamp.split_once('.')?;
    let secs: i64 = secs.parse().ok()?;
    let millis: i64 = millis.parse().ok()?;
    DateTime::from_timestamp_millis(secs.checked_mul(1000)?.checked_add(millis)?)
}

/// Kill records in `text` logged at or after `since`, oldest first.
#[must_use]
pub fn kill_records(text: &str, since: DateTime<Utc>) -> Vec<AuditRecord> {
    text.lines()
        .filter_map(parse_line)
        .filter(|r| r.is_kill() && r.is_since(since))
        .collect()
}

/// Somewhere seccomp audit records can be read from.
pub trait AuditSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Starts reading at the current end of the source.
    ///
    /// The cursor yields kill records logged from now on and stamped at or
    /// after `since`; history already in the source is never returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the source exists but cannot be opened.
    fn follow(&self, since: DateTime<Utc>) -> Result<Box<dyn AuditCursor>>;
}

/// A read position in an [`AuditSource`].
pub trait AuditCursor: Send {
    /// Kill records logged since the previous poll.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read.
    fn poll(&mut self) -> Result<Vec<AuditRecord>>;
}

/// The `auditd` log file.
#[derive(Debug, Clone)]
pub struct AuditLogFile {
    path: PathBuf,
}

impl AuditLogFile {
    /// Reads records from `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSource for AuditLogFile {
    fn name(&self) -> &str {
        "audit-log"
    }

    fn follow(&self, since: DateTime<Utc>) -> Result<Box<dyn AuditCursor>> {
        let offset = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(SyswardenError::io(&self.path, e)),
        };
        Ok(Box::new(LogCursor {
            path: self.path.clone(),
            offset,
            since,
        }))
    }
}

/// Byte offset into an audit log; only complete lines are consumed.
#[derive(Debug)]
struct LogCursor {
    path: PathBuf,
    offset: u64,
    since: DateTime<Utc>,
}

impl AuditCursor for LogCursor {
    fn poll(&mut self) -> Result<Vec<AuditRecord>> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SyswardenError::io(&self.path, e)),
        };
        let len = file
            .metadata()
            .map_err(|e| SyswardenError::io(&self.path, e))?
            .len();
        if len < self.offset {
            tracing::debug!(path = %self.path.display(), "audit log rotated");
            self.offset = 0;
        }
        let _ = file
            .seek(SeekFrom::Start(self.offset))
            .map_err(|e| SyswardenError::io(&self.path, e))?;
        let mut buf = Vec::new();
        let _ = file
            .read_to_end(&mut buf)
            .map_err(|e| SyswardenError::io(&self.path, e))?;
        let complete = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        self.offset += complete as u64;
        Ok(kill_records(
            &String::from_utf8_lossy(&buf[..complete]),
            self.since,
        ))
    }
}

/// The kernel ring buffer, read through `/dev/kmsg`.
///
/// A cursor keeps its descriptor open, positioned after the newest record
/// at the time it was created. Reads are non-blocking.
#[derive(Debug, Clone)]
pub struct KernelRing {
    path: PathBuf,
}

impl Default for KernelRing {
    fn default() -> Self {
        Self {
            path: PathBuf::from(KMSG),
        }
    }
}

impl AuditSource for KernelRing {
    fn name(&self) -> &str {
        "kmsg"
    }

    fn follow(&self, since: DateTime<Utc>) -> Result<Box<dyn AuditCursor>> {
        use std::os::unix::fs::OpenOptionsExt as _;

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| SyswardenError::io(&self.path, e))?;
        let _ = file
            .seek(SeekFrom::End(0))
            .map_err(|e| SyswardenError::io(&self.path, e))?;
        Ok(Box::new(RingCursor {
            path: self.path.clone(),
            file,
            since,
        }))
    }
}

#[derive(Debug)]
struct RingCursor {
    path: PathBuf,
    file: std::fs::File,
    since: DateTime<Utc>,
}

impl AuditCursor for RingCursor {
    fn poll(&mut self) -> Result<Vec<AuditRecord>> {
        let mut text = String::new();
        // One read returns one record.
        let mut buf = vec![0u8; 8192];
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    text.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if !text.ends_with('\n') {
                        text.push('\n');
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                // A record was overwritten while reading; keep going.
                Err(e) if e.raw_os_error() == Some(libc::EPIPE) => {}
                Err(e) => return Err(SyswardenError::io(&self.path, e)),
            }
        }
        Ok(kill_records(&text, self.since))
    }
}

/// Several sources read together.
///
/// A source that cannot be opened or read is logged and skipped.
pub struct AuditTrail {
    sources: Vec<Box<dyn AuditSource>>,
}

impl AuditTrail {
    /// Builds a trail from explicit sources.
    #[must_use]
    pub fn new(sources: Vec<Box<dyn AuditSource>>) -> Self {
        Self { sources }
    }

    /// The configured audit log, then the kernel ring buffer.
    #[must_use]
    pub fn from_config(config: &LaunchConfig) -> Self {
        Self::new(vec![
            Box::new(AuditLogFile::new(config.audit_log.clone())),
            Box::new(KernelRing::default()),
        ])
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sources.iter().map(|s| s.name()))
            .finish()
    }
}

impl AuditSource for AuditTrail {
    fn name(&self) -> &str {
        "audit-trail"
    }

    fn follow(&self, since: DateTime<Utc>) -> Result<Box<dyn AuditCursor>> {
        let mut cursors = Vec::new();
        for source in &self.sources {
            match source.follow(since) {
                Ok(cursor) => cursors.push((source.name().to_owned(), cursor)),
                Err(e) => {
                    tracing::debug!(source = source.name(), error = %e, "audit source unavailable");
                }
            }
        }
        Ok(Box::new(TrailCursor { cursors }))
    }
}

struct TrailCursor {
    cursors: Vec<(String, Box<dyn AuditCursor>)>,
}

impl AuditCursor for TrailCursor {
    fn poll(&mut self) -> Result<Vec<AuditRecord>> {
        let mut records = Vec::new();
        for (name, cursor) in &mut self.cursors {
            match cursor.poll() {
                Ok(found) => {
                    for record in &found {
                        tracing::debug!(
                            source = %name,
                            pid = record.pid,
                            nr = record.syscall_nr,
                            "audit record found"
                        );
                    }
                    records.extend(found);
                }
                Err(e) => tracing::debug!(source = %name, error = %e, "audit source unreadable"),
            }
        }
        Ok(records)
    }
}

/// Fixed audit text, for tests and offline classification.
///
/// A cursor serves the matching records on its first poll.
#[derive(Debug, Clone, Default)]
pub struct StaticAudit {
    text: String,
}

impl StaticAudit {
    /// Serves records from `text`.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl AuditSource for StaticAudit {
    fn name(&self) -> &str {
        "static"
    }

    fn follow(&self, since: DateTime<Utc>) -> Result<Box<dyn AuditCursor>> {
        Ok(Box::new(StaticCursor(kill_records(&self.text, since))))
    }
}

struct StaticCursor(Vec<AuditRecord>);

impl AuditCursor for StaticCursor {
    fn poll(&mut self) -> Result<Vec<AuditRecord>> {
        Ok(std::mem::take(&mut self.0))
    }
}

/// Kill records read from a cursor and not yet claimed.
pub struct AuditWatch {
    cursor: Box<dyn AuditCursor>,
    backlog: Vec<AuditRecord>,
}

impl std::fmt::Debug for AuditWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditWatch")
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}

impl AuditWatch {
    /// Watches `cursor`.
    #[must_use]
    pub fn new(cursor: Box<dyn AuditCursor>) -> Self {
        Self {
            cursor,
            backlog: Vec::new(),
        }
    }

    /// Follows `source` from now on, for a launch that started at `since`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be opened.
    pub fn follow(source: &dyn AuditSource, since: DateTime<Utc>) -> Result<Self> {
        Ok(Self::new(source.follow(since)?))
    }

    /// Reads newly logged records into the backlog. Read errors are logged.
    pub fn refresh(&mut self) {
        match self.cursor.poll() {
            Ok(records) => self.backlog.extend(records),
            Err(e) => tracing::warn!(error = %e, "audit read failed"),
        }
    }

    /// Removes and returns the newest backlog record for `pid`.
    pub fn take(&mut self, pid: u32) -> Option<AuditRecord> {
        let index = self.backlog.iter().rposition(|r| r.pid == pid)?;
        Some(self.backlog.remove(index))
    }

    /// Removes and returns every backlog record not about `pid`.
    pub fn take_others(&mut self, pid: u32) -> Vec<AuditRecord> {
        let (keep, others) = std::mem::take(&mut self.backlog)
            .into_iter()
            .partition(|r| r.pid == pid);
        self.backlog = keep;
        others
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use chrono::TimeZone as _;

    use super::*;

    const AUDIT_LOG: &str = "\
type=SYSCALL msg=audit(1700000000.100:450): arch=c000003e syscall=59 success=yes pid=4242 comm=\"server\"
type=SECCOMP msg=audit(1700000000.123:456): auid=1000 uid=1000 gid=1000 ses=2 pid=4243 comm=\"other\" sig=31 arch=c000003e syscall=165 compat=0 code=0x80000000
type=SECCOMP msg=audit(1700000000.124:457): auid=1000 uid=1000 gid=1000 ses=2 pid=4242 comm=\"server\" sig=31 arch=c000003e syscall=101 compat=0 code=0x80000000
";

    fn long_ago() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
    }

    fn kill_line(pid: u32, nr: i64, at: DateTime<Utc>) -> String {
        format!(
            "type=SECCOMP msg=audit({}.{:03}:9): ses=3 pid={pid} comm=\"w\" sig=31 \
             arch=c000003e syscall={nr} compat=0 code=0x80000000\n",
            at.timestamp(),
            at.timestamp_subsec_millis()
        )
    }

    #[test]
    fn parses_seccomp_record() {
        let line = AUDIT_LOG.lines().nth(2).unwrap();
        let record = parse_line(line).unwrap();
        assert_eq!(record.pid, 4242);
        assert_eq!(record.syscall_nr, 101);
        assert_eq!(record.arch.as_deref(), Some("c000003e"));
        assert_eq!(record.signal, Some(31));
        assert_eq!(record.session, Some(2));
        assert_eq!(record.code, Some(0x8000_0000));
        assert_eq!(
            record.timestamp.unwrap().timestamp_millis(),
            1_700_000_000_124
        );
        assert!(record.is_kill());
    }

    #[test]
    fn ignores_other_record_types() {
        assert!(parse_line(AUDIT_LOG.lines().next().unwrap()).is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn only_kill_actions_count() {
        let trap = "type=SECCOMP msg=audit(1700000000.1:1): pid=5 sig=31 syscall=101 code=0x30000";
        let logged = "type=SECCOMP msg=audit(1700000000.1:2): pid=5 sig=0 syscall=101 code=0x7ffc0000";
        let thread = "type=SECCOMP msg=audit(1700000000.1:3): pid=5 sig=31 syscall=101 code=0x0";
        let bare = "type=SECCOMP msg=audit(1700000000.1:4): pid=5 sig=31 syscall=101";
        assert!(!parse_line(trap).unwrap().is_kill());
        assert!(!parse_line(logged).unwrap().is_kill());
        assert!(parse_line(thread).unwrap().is_kill());
        assert!(parse_line(bare).unwrap().is_kill());
    }

    #[test]
    fn stale_records_are_ignored() {
        assert_eq!(kill_records(AUDIT_LOG, long_ago()).len(), 2);
        assert!(kill_records(AUDIT_LOG, Utc::now()).is_empty());
        // Without a stamp a record cannot be placed after a launch.
        assert!(kill_records("type=SECCOMP pid=1 sig=31 syscall=2", long_ago()).is_empty());
    }

    #[test]
    fn static_cursor_serves_records_once() {
        let audit = StaticAudit::new(AUDIT_LOG);
        let mut cursor = audit.follow(long_ago()).unwrap();
        let pids: Vec<u32> = cursor.poll().unwrap().iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![4243, 4242]);
        assert!(cursor.poll().unwrap().is_empty());
    }

    #[test]
    fn kmsg_format_is_understood() {
        let line = "5,1234,987654321,-;audit: type=1326 audit(1700000000.124:457): auid=4294967295 \
                    uid=0 gid=0 ses=4294967295 pid=77 comm=\"a.out\" exe=\"/tmp/a.out\" sig=31 \
                    arch=c000003e syscall=57 compat=0 ip=0x7f code=0x80000000";
        let record = parse_line(line).unwrap();
        assert_eq!((record.pid, record.syscall_nr), (77, 57));
        assert_eq!(record.session, Some(u32::MAX));
        assert!(record.timestamp.is_some());
    }

    #[test]
    fn log_cursor_skips_history_and_reads_appends_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");
        let since = Utc::now();
        // Same pid, earlier run.
        std::fs::write(&path, kill_line(4242, 101, long_ago())).unwrap();

        let mut cursor = AuditLogFile::new(&path).follow(since).unwrap();
        assert!(cursor.poll().unwrap().is_empty());

        let mut log = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        log.write_all(kill_line(4242, 57, Utc::now()).as_bytes()).unwrap();
        // Half-written line stays for the next poll.
        log.write_all(b"type=SECCOMP msg=audit(").unwrap();
        let found = cursor.poll().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].syscall_nr, 57);
        assert!(cursor.poll().unwrap().is_empty());
    }

    #[test]
    fn log_cursor_ignores_replayed_old_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");
        let mut cursor = AuditLogFile::new(&path).follow(Utc::now()).unwrap();
        std::fs::write(&path, kill_line(4242, 101, long_ago())).unwrap();
        assert!(cursor.poll().unwrap().is_empty());
    }

    #[test]
    fn missing_audit_log_is_not_an_error() {
        let source = AuditLogFile::new("/nonexistent/audit.log");
        assert!(source.follow(Utc::now()).unwrap().poll().unwrap().is_empty());
    }

    #[test]
    fn trail_reads_every_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let empty = dir.path().join("audit.log");
        std::fs::write(&empty, "").unwrap();
        let trail = AuditTrail::new(vec![
            Box::new(AuditLogFile::new(&empty)),
            Box::new(KernelRing {
                path: dir.path().join("no-kmsg"),
            }),
            Box::new(StaticAudit::new(AUDIT_LOG)),
        ]);
        let mut watch = AuditWatch::follow(&trail, long_ago()).unwrap();
        watch.refresh();
        assert_eq!(watch.take(4242).unwrap().syscall_nr, 101);
        assert!(watch.take(4242).is_none());
        let others = watch.take_others(4242);
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].pid, 4243);
    }
}
