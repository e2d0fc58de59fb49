//! Domain primitive types used across the syswarden workspace.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyswardenError};

/// Kernel name of a system call, e.g. `openat` or `exit_group`.
///
/// Names are lowercase ASCII identifiers; ordering is lexical, which is the
/// order rules appear in a serialized filter profile.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyscallName(String);

impl SyscallName {
    /// Creates a syscall name after validating its spelling.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or contains characters other
    /// than lowercase ASCII letters, digits and underscores.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(SyswardenError::Parse {
                what: "syscall name",
                message: format!("invalid syscall name: {name:?}"),
            });
        }
        Ok(Self(name))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyscallName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SyscallName {
    type Err = SyswardenError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for SyscallName {
    type Error = SyswardenError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SyscallName> for String {
    fn from(value: SyscallName) -> Self {
        value.0
    }
}

/// How a syscall entered a usage set.
///
/// `Observed` dominates `Baseline` when two sets are joined, so merging is
/// commutative regardless of which side carried which tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// Part of the fixed startup/teardown allow-list.
    Baseline,
    /// Seen while tracing the target.
    Observed,
}

impl Provenance {
    /// Least upper bound of two provenance tags.
    #[must_use]
    pub fn join(self, other: Self) -> Self {
        self.max(other)
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Observed => write!(f, "observed"),
        }
    }
}

/// Unique identifier for a trace session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a session ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random session ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 hash digest used for content verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha256Hash(String);

impl Sha256Hash {
    /// Creates a hash from a hex-encoded string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid 64-character hex string.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let hex = hex.into();
        if hex.len() != crate::constants::SHA256_HEX_LENGTH
            || !hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(SyswardenError::Config {
                message: format!("invalid SHA-256 hex string: {hex}"),
            });
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// Builds a hash from raw digest bytes.
    #[must_use]
    pub fn from_digest(bytes: &[u8]) -> Self {
        use std::fmt::Write as _;

        let mut hex = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            let _ = write!(hex, "{b:02x}");
        }
        Self(hex)
    }

    /// Returns the hex-encoded hash string.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

/// Identity of the binary or image a policy is built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetIdentity {
    /// Human-readable target name (service or image name).
    pub name: String,
    /// Path of the executable inside the target.
    pub executable: PathBuf,
    /// Digest of the executable, when it was available at bundling time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Sha256Hash>,
}

impl TargetIdentity {
    /// Creates an identity without an executable digest.
    #[must_use]
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            digest: None,
        }
    }

    /// Attaches an executable digest.
    #[must_use]
    pub fn with_digest(mut self, digest: Sha256Hash) -> Self {
        self.digest = Some(digest);
        self
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.executable.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_name_accepts_kernel_spelling() {
        let name = SyscallName::new("exit_group").unwrap();
        assert_eq!(name.as_str(), "exit_group");
        assert!(SyscallName::new("pread64").is_ok());
    }

    #[test]
    fn syscall_name_rejects_garbage() {
        assert!(SyscallName::new("").is_err());
        assert!(SyscallName::new("Open").is_err());
        assert!(SyscallName::new("open at").is_err());
    }

    #[test]
    fn syscall_names_sort_lexically() {
        let mut names: Vec<SyscallName> = ["write", "accept", "close"]
            .iter()
            .map(|n| SyscallName::new(*n).unwrap())
            .collect();
        names.sort();
        let sorted: Vec<&str> = names.iter().map(SyscallName::as_str).collect();
        assert_eq!(sorted, ["accept", "close", "write"]);
    }

    #[test]
    fn syscall_name_deserialization_validates() {
        let bad: std::result::Result<SyscallName, _> = serde_json::from_str("\"NOPE\"");
        assert!(bad.is_err());
    }

    #[test]
    fn observed_dominates_baseline() {
        assert_eq!(
            Provenance::Baseline.join(Provenance::Observed),
            Provenance::Observed
        );
        assert_eq!(
            Provenance::Observed.join(Provenance::Baseline),
            Provenance::Observed
        );
        assert_eq!(
            Provenance::Baseline.join(Provenance::Baseline),
            Provenance::Baseline
        );
    }

    #[test]
    fn sha256_from_digest_is_lower_hex() {
        let h = Sha256Hash::from_digest(&[0xab; 32]);
        assert_eq!(h.as_hex().len(), 64);
        assert!(h.as_hex().starts_with("abab"));
        assert!(Sha256Hash::from_hex(h.as_hex()).is_ok());
    }

    #[test]
    fn sha256_from_hex_rejects_short_input() {
        assert!(Sha256Hash::from_hex("abc").is_err());
    }
}
