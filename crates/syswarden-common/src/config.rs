//! Global configuration model for syswarden.
//!
//! The configuration is a JSON document; every field has a default so a
//! partial file (or none at all) is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, SyswardenError};

/// Root configuration for syswarden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyswardenConfig {
    /// Base directory for syswarden state and data.
    pub data_dir: PathBuf,
    /// Trace session bounds.
    pub trace: TraceConfig,
    /// Synthesis settings.
    pub synthesis: SynthesisConfig,
    /// Directories every path-permission rule must lie within.
    pub app_roots: Vec<PathBuf>,
    /// Launch and monitoring settings.
    pub launch: LaunchConfig,
}

impl Default for SyswardenConfig {
    fn default() -> Self {
        Self {
            data_dir: constants::data_dir().clone(),
            trace: TraceConfig::default(),
            synthesis: SynthesisConfig::default(),
            app_roots: Vec::new(),
            launch: LaunchConfig::default(),
        }
    }
}

impl SyswardenConfig {
    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading configuration");
        let raw = std::fs::read_to_string(path).map_err(|e| SyswardenError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file if it exists, otherwise returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `SyswardenError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.trace.max_events == 0 {
            return Err(SyswardenError::Config {
                message: "trace.max_events must be greater than zero".into(),
            });
        }
        if self.trace.max_duration_secs == 0 {
            return Err(SyswardenError::Config {
                message: "trace.max_duration_secs must be greater than zero".into(),
            });
        }
        if let Some(root) = self.app_roots.iter().find(|r| !r.is_absolute()) {
            return Err(SyswardenError::Config {
                message: format!("application root must be absolute: {}", root.display()),
            });
        }
        Ok(())
    }
}

/// Bounds applied to every trace session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Maximum wall-clock duration of a session, in seconds.
    pub max_duration_secs: u64,
    /// Maximum number of syscall events recorded per session.
    pub max_events: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: constants::DEFAULT_TRACE_DURATION_SECS,
            max_events: constants::DEFAULT_MAX_EVENTS,
        }
    }
}

/// Settings for profile synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Default action name: `kill-process`, `errno` or `log`.
    pub default_action: String,
    /// `errno` value returned when `default_action` is `errno`.
    pub errno_ret: u16,
    /// Architectures the filter targets, in libseccomp spelling.
    pub architectures: Vec<String>,
    /// Observed syscalls required before freezing without confirmation.
    pub min_observed_syscalls: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            default_action: "kill-process".into(),
            errno_ret: constants::DEFAULT_ERRNO_RET,
            architectures: vec!["SCMP_ARCH_X86_64".into()],
            min_observed_syscalls: constants::DEFAULT_MIN_OBSERVED_SYSCALLS,
        }
    }
}

/// Settings for the launcher and its monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Kernel audit trail consulted after a policy kill.
    pub audit_log: PathBuf,
    /// How many times the audit trail is re-read while waiting for the record.
    pub audit_retries: u32,
    /// Delay between audit trail reads, in milliseconds.
    pub audit_retry_delay_ms: u64,
    /// Where violation records are appended.
    pub violation_log: PathBuf,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            audit_log: PathBuf::from(constants::DEFAULT_AUDIT_LOG),
            audit_retries: 5,
            audit_retry_delay_ms: 50,
            violation_log: constants::default_violation_log(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "app_roots": ["/srv/app"], "trace": { "max_events": 10 } }"#)
            .expect("write");

        let config = SyswardenConfig::load(&path).expect("load");
        assert_eq!(config.app_roots, vec![PathBuf::from("/srv/app")]);
        assert_eq!(config.trace.max_events, 10);
        assert_eq!(
            config.trace.max_duration_secs,
            constants::DEFAULT_TRACE_DURATION_SECS
        );
        assert_eq!(config.synthesis.default_action, "kill-process");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config =
            SyswardenConfig::load_or_default(&dir.path().join("absent.json")).expect("defaults");
        assert_eq!(config.trace, TraceConfig::default());
    }

    #[test]
    fn relative_app_root_is_rejected() {
        let config = SyswardenConfig {
            app_roots: vec![PathBuf::from("srv/app")],
            ..SyswardenConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_event_cap_is_rejected() {
        let mut config = SyswardenConfig::default();
        config.trace.max_events = 0;
        assert!(config.validate().is_err());
    }
}
