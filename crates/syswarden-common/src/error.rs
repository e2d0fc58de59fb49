//! Unified error types for the syswarden workspace.
//!
//! Every crate reports failures through [`SyswardenError`]. The policy
//! conditions (`TracingUnavailable`, `ProfileGenerationIncomplete`,
//! `PolicyScopeViolation`, `BundleChecksumMismatch`,
//! `RuntimeViolationDetected`) are distinct variants so callers can match on
//! them instead of parsing messages.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum SyswardenError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A document could not be parsed.
    #[error("parse error in {what}: {message}")]
    Parse {
        /// Kind of document being parsed.
        what: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The host cannot intercept syscalls of the target.
    ///
    /// Fatal; callers must not retry automatically.
    #[error("tracing unavailable: {reason}")]
    TracingUnavailable {
        /// Why interception could not be set up.
        reason: String,
    },

    /// Synthesis was requested on an empty or undersized usage set without
    /// explicit confirmation.
    #[error(
        "profile generation incomplete: {observed} observed syscall(s), at least {minimum} required \
         (confirm explicitly to freeze anyway)"
    )]
    ProfileGenerationIncomplete {
        /// Number of syscalls actually observed.
        observed: usize,
        /// Configured minimum.
        minimum: usize,
    },

    /// A path rule lies outside every declared application root.
    #[error("path rule {pattern} is outside the application roots {roots:?}")]
    PolicyScopeViolation {
        /// Offending path pattern.
        pattern: String,
        /// Declared application roots.
        roots: Vec<PathBuf>,
    },

    /// The bundle checksum does not match its referenced artifacts.
    #[error("bundle checksum mismatch: manifest says {expected}, artifacts hash to {actual}")]
    BundleChecksumMismatch {
        /// Checksum recorded in the manifest.
        expected: String,
        /// Checksum recomputed from the artifacts.
        actual: String,
    },

    /// The executable does not match the bundle's target identity.
    #[error("executable {path} does not match target identity: expected {expected}, got {actual}")]
    TargetMismatch {
        /// Executable that was about to be launched.
        path: PathBuf,
        /// Digest recorded in the bundle.
        expected: String,
        /// Digest of the executable on disk.
        actual: String,
    },

    /// The supervised process was killed by kernel policy enforcement.
    #[error("runtime policy violation: pid {pid} killed on syscall {syscall}")]
    RuntimeViolationDetected {
        /// Process that was killed.
        pid: u32,
        /// Offending syscall, or `unknown` when the audit trail had no record.
        syscall: String,
    },

    /// libseccomp rejected a filter operation.
    #[error("seccomp error: {message}")]
    Seccomp {
        /// Description reported by libseccomp.
        message: String,
    },

    /// Landlock ruleset construction failed.
    #[error("landlock error: {message}")]
    Landlock {
        /// Description reported by the landlock crate.
        message: String,
    },

    /// A child process could not be created or supervised.
    #[error("process error: {message}")]
    Process {
        /// Description of the failure.
        message: String,
    },

    /// A workload scenario driver reported a failure.
    #[error("scenario {scenario} failed: {message}")]
    Scenario {
        /// Name of the scenario driver.
        scenario: String,
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl SyswardenError {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` for conditions that abort the operation and must not be
    /// retried automatically.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TracingUnavailable { .. }
                | Self::PolicyScopeViolation { .. }
                | Self::BundleChecksumMismatch { .. }
                | Self::TargetMismatch { .. }
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SyswardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_mismatch_is_fatal() {
        let err = SyswardenError::BundleChecksumMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn incomplete_profile_is_not_fatal() {
        let err = SyswardenError::ProfileGenerationIncomplete {
            observed: 0,
            minimum: 1,
        };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("0 observed"));
    }
}
