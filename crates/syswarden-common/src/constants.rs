//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for syswarden data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/syswarden";

/// Returns the data directory, preferring `$HOME/.syswarden` and falling
/// back to `/var/lib/syswarden`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".syswarden");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Returns the default configuration file path.
pub fn default_config_file() -> PathBuf {
    data_dir().join("config.json")
}

/// Returns the default violation log path.
pub fn default_violation_log() -> PathBuf {
    data_dir().join("violations.jsonl")
}

/// Kernel audit log written by `auditd`.
pub const DEFAULT_AUDIT_LOG: &str = "/var/log/audit/audit.log";

/// Yama ptrace restriction knob.
pub const YAMA_PTRACE_SCOPE: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// Default upper bound on a trace session's wall-clock duration, in seconds.
pub const DEFAULT_TRACE_DURATION_SECS: u64 = 30;

/// Default upper bound on the number of events recorded per trace session.
pub const DEFAULT_MAX_EVENTS: u64 = 1_000_000;

/// Default minimum number of observed syscalls before a profile may be
/// frozen without confirmation.
pub const DEFAULT_MIN_OBSERVED_SYSCALLS: usize = 1;

/// Default `errno` returned by a deny-errno profile (`EPERM`).
pub const DEFAULT_ERRNO_RET: u16 = 1;

/// Bundle manifest file name inside a bundle directory.
pub const BUNDLE_MANIFEST: &str = "bundle.json";

/// Filter profile file name inside a bundle directory.
pub const BUNDLE_FILTER: &str = "filter.json";

/// Path-permission profile file name inside a bundle directory.
pub const BUNDLE_PATHS: &str = "paths.json";

/// SHA-256 digest length in hex characters.
pub const SHA256_HEX_LENGTH: usize = 64;

/// Application name used in CLI output and state files.
pub const APP_NAME: &str = "syswarden";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "swd";
