//! Seccomp filter profiles.
//!
//! A [`FilterProfile`] is an allow-list with a restrictive default action.
//! On disk it is a Docker-compatible seccomp document with one extra
//! `version` field:
//!
//! ```json
//! {
//!   "version": 2,
//!   "defaultAction": "SCMP_ACT_KILL_PROCESS",
//!   "architectures": ["SCMP_ARCH_X86_64"],
//!   "syscalls": [
//!     { "names": ["accept"], "action": "SCMP_ACT_ALLOW", "comment": "observed" }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use syswarden_common::error::{Result, SyswardenError};
use syswarden_common::types::{Provenance, SyscallName};

const ACT_ALLOW: &str = "SCMP_ACT_ALLOW";
const ACT_KILL_PROCESS: &str = "SCMP_ACT_KILL_PROCESS";
const ACT_ERRNO: &str = "SCMP_ACT_ERRNO";
const ACT_LOG: &str = "SCMP_ACT_LOG";

/// What the kernel does with a syscall that matches no rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DefaultAction {
    /// Kill the whole process with `SIGSYS`.
    #[default]
    KillProcess,
    /// Fail the syscall with the given errno.
    Errno(u16),
    /// Allow the syscall but log it to the audit trail.
    Log,
}

impl DefaultAction {
    /// Parses a configuration name (`kill-process`, `errno`, `log`).
    ///
    /// # Errors
    ///
    /// Returns `Config` for unknown names, including `allow`.
    pub fn from_config(name: &str, errno_ret: u16) -> Result<Self> {
        match name {
            "kill-process" | "kill" => Ok(Self::KillProcess),
            "errno" => Ok(Self::Errno(errno_ret)),
            "log" => Ok(Self::Log),
            other => Err(SyswardenError::Config {
                message: format!(
                    "unsupported default action '{other}' (expected kill-process, errno or log)"
                ),
            }),
        }
    }

    const fn scmp_name(self) -> &'static str {
        match self {
            Self::KillProcess => ACT_KILL_PROCESS,
            Self::Errno(_) => ACT_ERRNO,
            Self::Log => ACT_LOG,
        }
    }
}

impl fmt::Display for DefaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KillProcess => write!(f, "kill-process"),
            Self::Errno(n) => write!(f, "errno({n})"),
            Self::Log => write!(f, "log"),
        }
    }
}

/// One allow rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterRule {
    /// Allowed syscall.
    pub syscall: SyscallName,
    /// Why the syscall is allowed.
    pub provenance: Provenance,
}

/// A versioned seccomp allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterProfile {
    default_action: DefaultAction,
    architectures: Vec<String>,
    rules: Vec<FilterRule>,
    version: u32,
}

impl FilterProfile {
    /// Builds a profile. Rules are sorted by name and duplicates are joined.
    ///
    /// # Errors
    ///
    /// Returns `Config` if an architecture is not in libseccomp spelling.
    pub fn new(
        default_action: DefaultAction,
        architectures: Vec<String>,
        rules: impl IntoIterator<Item = FilterRule>,
        version: u32,
    ) -> Result<Self> {
        for arch in &architectures {
            validate_arch(arch)?;
        }
        let mut by_name: BTreeMap<SyscallName, Provenance> = BTreeMap::new();
        for rule in rules {
            let _ = by_name
                .entry(rule.syscall)
                .and_modify(|p| *p = p.join(rule.provenance))
                .or_insert(rule.provenance);
        }
        Ok(Self {
            default_action,
            architectures,
            rules: by_name
                .into_iter()
                .map(|(syscall, provenance)| FilterRule {
                    syscall,
                    provenance,
                })
                .collect(),
            version,
        })
    }

    /// Default action for unlisted syscalls.
    #[must_use]
    pub const fn default_action(&self) -> DefaultAction {
        self.default_action
    }

    /// Target architectures, in libseccomp spelling.
    #[must_use]
    pub fn architectures(&self) -> &[String] {
        &self.architectures
    }

    /// Rules, sorted by syscall name.
    #[must_use]
    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Profile version.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Allowed syscall names.
    #[must_use]
    pub fn allowlist(&self) -> BTreeSet<SyscallName> {
        self.rules.iter().map(|r| r.syscall.clone()).collect()
    }

    /// Returns `true` if `name` is allowed.
    #[must_use]
    pub fn allows(&self, name: &SyscallName) -> bool {
        self.rules
            .binary_search_by(|r| r.syscall.cmp(name))
            .is_ok()
    }

    /// Returns a copy without `name`, at the same version.
    #[must_use]
    pub fn without(&self, name: &SyscallName) -> Self {
        Self {
            rules: self
                .rules
                .iter()
                .filter(|r| &r.syscall != name)
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    /// Returns a copy carrying `version`.
    #[must_use]
    pub fn with_version(&self, version: u32) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    /// Serializes to the canonical JSON form, newline-terminated.
    ///
    /// The output depends only on the profile's contents.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(&ProfileDocument::from(self))?;
        json.push('\n');
        Ok(json)
    }

    /// Parses a profile document.
    ///
    /// Groups listing several names are split into one rule per name. A
    /// group is `baseline` when its comment says so, `observed` otherwise.
    ///
    /// # Errors
    ///
    /// Returns `Parse` for malformed JSON, an allowing default action, rule
    /// actions other than allow, or invalid names.
    pub fn from_json(raw: &str) -> Result<Self> {
        let doc: ProfileDocument =
            serde_json::from_str(raw).map_err(|e| parse_error(e.to_string()))?;
        doc.try_into()
    }

    /// Loads a profile from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| SyswardenError::io(path, e))?;
        Self::from_json(&raw)
    }

    /// Writes the canonical JSON form to `path`, replacing it atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, self.to_json()?).map_err(|e| SyswardenError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| SyswardenError::io(path, e))
    }
}

fn parse_error(message: impl Into<String>) -> SyswardenError {
    SyswardenError::Parse {
        what: "filter profile",
        message: message.into(),
    }
}

fn validate_arch(arch: &str) -> Result<()> {
    let valid = arch.strip_prefix("SCMP_ARCH_").is_some_and(|rest| {
        !rest.is_empty()
            && rest
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    });
    if valid {
        Ok(())
    } else {
        Err(SyswardenError::Config {
            message: format!("invalid architecture '{arch}' (expected e.g. SCMP_ARCH_X86_64)"),
        })
    }
}

// ── Document form ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileDocument {
    #[serde(default = "default_version")]
    version: u32,
    default_action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_errno_ret: Option<u16>,
    #[serde(default)]
    architectures: Vec<String>,
    #[serde(default)]
    syscalls: Vec<RuleGroup>,
}

const fn default_version() -> u32 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
struct RuleGroup {
    names: Vec<String>,
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

impl From<&FilterProfile> for ProfileDocument {
    fn from(p: &FilterProfile) -> Self {
        Self {
            version: p.version,
            default_action: p.default_action.scmp_name().into(),
            default_errno_ret: match p.default_action {
                DefaultAction::Errno(n) => Some(n),
                _ => None,
            },
            architectures: p.architectures.clone(),
            syscalls: p
                .rules
                .iter()
                .map(|r| RuleGroup {
                    names: vec![r.syscall.to_string()],
                    action: ACT_ALLOW.into(),
                    comment: Some(r.provenance.to_string()),
                })
                .collect(),
        }
    }
}

impl TryFrom<ProfileDocument> for FilterProfile {
    type Error = SyswardenError;

    fn try_from(doc: ProfileDocument) -> Result<Self> {
        let default_action = match doc.default_action.as_str() {
            ACT_KILL_PROCESS => DefaultAction::KillProcess,
            ACT_ERRNO => DefaultAction::Errno(doc.default_errno_ret.unwrap_or(1)),
            ACT_LOG => DefaultAction::Log,
            other => {
                return Err(parse_error(format!("unsupported defaultAction '{other}'")));
            }
        };

        let mut rules = Vec::new();
        for group in doc.syscalls {
            if group.action != ACT_ALLOW {
                return Err(parse_error(format!(
                    "unsupported rule action '{}' for {:?}",
                    group.action, group.names
                )));
            }
            let provenance = if group.comment.as_deref() == Some("baseline") {
                Provenance::Baseline
            } else {
                Provenance::Observed
            };
            for name in group.names {
                let syscall =
                    SyscallName::new(name).map_err(|e| parse_error(e.to_string()))?;
                rules.push(FilterRule {
                    syscall,
                    provenance,
                });
            }
        }

        Self::new(default_action, doc.architectures, rules, doc.version)
            .map_err(|e| parse_error(e.to_string()))
    }
}
