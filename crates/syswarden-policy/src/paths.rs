//! Path-permission profiles.
//!
//! An ordered list of `(path pattern, permissions)` rules. Patterns are
//! absolute paths that may end in glob syntax (`*`, `?`, `[..]`, `{..}`);
//! everything before the first glob metacharacter is the literal prefix.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use syswarden_common::error::{Result, SyswardenError};

const GLOB_CHARS: &[char] = &['*', '?', '[', '{'];

/// Subset of {read, write, execute, append}.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionSet {
    /// `r`
    pub read: bool,
    /// `w`
    pub write: bool,
    /// `x`
    pub execute: bool,
    /// `a`
    pub append: bool,
}

impl PermissionSet {
    /// Read and execute, as granted to shared libraries.
    pub const READ_EXECUTE: Self = Self {
        read: true,
        write: false,
        execute: true,
        append: false,
    };

    /// Returns `true` if no permission is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        !(self.read || self.write || self.execute || self.append)
    }
}

impl FromStr for PermissionSet {
    type Err = SyswardenError;

    fn from_str(s: &str) -> Result<Self> {
        let mut set = Self::default();
        for c in s.chars() {
            let flag = match c {
                'r' => &mut set.read,
                'w' => &mut set.write,
                'x' => &mut set.execute,
                'a' => &mut set.append,
                other => {
                    return Err(SyswardenError::Parse {
                        what: "path permissions",
                        message: format!("unknown permission '{other}' in '{s}'"),
                    });
                }
            };
            *flag = true;
        }
        if set.is_empty() {
            return Err(SyswardenError::Parse {
                what: "path permissions",
                message: "empty permission set".into(),
            });
        }
        Ok(set)
    }
}

impl TryFrom<String> for PermissionSet {
    type Error = SyswardenError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PermissionSet> for String {
    fn from(p: PermissionSet) -> Self {
        p.to_string()
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (on, c) in [
            (self.read, 'r'),
            (self.write, 'w'),
            (self.execute, 'x'),
            (self.append, 'a'),
        ] {
            if on {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// One path rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathRule {
    /// Absolute path, optionally ending in glob syntax.
    pub pattern: String,
    /// Granted permissions.
    pub permissions: PermissionSet,
}

impl PathRule {
    /// Creates a rule.
    ///
    /// # Errors
    ///
    /// Returns `Parse` if the pattern is not absolute.
    pub fn new(pattern: impl Into<String>, permissions: PermissionSet) -> Result<Self> {
        let pattern = pattern.into();
        if !pattern.starts_with('/') {
            return Err(SyswardenError::Parse {
                what: "path profile",
                message: format!("path pattern '{pattern}' must be absolute"),
            });
        }
        Ok(Self {
            pattern,
            permissions,
        })
    }

    /// Returns `true` if the pattern contains glob syntax.
    #[must_use]
    pub fn is_glob(&self) -> bool {
        self.pattern.contains(GLOB_CHARS)
    }

    /// Literal part of the pattern: the whole pattern without glob syntax,
    /// else the directory that contains the first glob metacharacter.
    ///
    /// `/srv/app/data/**` and `/srv/app/data/log*` both yield
    /// `/srv/app/data`.
    #[must_use]
    pub fn literal_prefix(&self) -> &Path {
        match self.pattern.find(GLOB_CHARS) {
            None => Path::new(&self.pattern),
            Some(i) => {
                let head = &self.pattern[..i];
                let dir = head.rfind('/').map_or("/", |j| &head[..=j]);
                Path::new(dir)
            }
        }
    }

    /// The literal prefix, lexically normalized.
    ///
    /// # Errors
    ///
    /// Returns `PolicyScopeViolation` if the pattern contains a `..`
    /// component anywhere.
    pub fn normalized_prefix(&self) -> Result<PathBuf> {
        if self.pattern.split('/').any(|c| c == "..") {
            return Err(SyswardenError::PolicyScopeViolation {
                pattern: self.pattern.clone(),
                roots: Vec::new(),
            });
        }
        Ok(normalize(self.literal_prefix()))
    }
}

/// Lexical normalization: drops `.` components and repeated separators.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}

/// Ordered path rules for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPermissionProfile {
    /// Rules in declaration order.
    pub rules: Vec<PathRule>,
}

impl PathPermissionProfile {
    /// Creates a profile from rules.
    #[must_use]
    pub const fn new(rules: Vec<PathRule>) -> Self {
        Self { rules }
    }

    /// Returns `true` if there are no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Canonical JSON form, newline-terminated.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Parses either the JSON form or the text-line form.
    ///
    /// # Errors
    ///
    /// Returns `Parse` or `Serialization` errors for malformed input.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim_start().starts_with('{') {
            let profile: Self = serde_json::from_str(raw)?;
            for rule in &profile.rules {
                let _ = PathRule::new(rule.pattern.clone(), rule.permissions)?;
            }
            Ok(profile)
        } else {
            crate::parser::parse_text(raw)
        }
    }

    /// Loads a profile from a file in either form.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| SyswardenError::io(path, e))?;
        Self::parse(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, perms: &str) -> PathRule {
        PathRule::new(pattern, perms.parse().unwrap()).unwrap()
    }

    #[test]
    fn permissions_parse_and_display_in_canonical_order() {
        let p: PermissionSet = "awr".parse().unwrap();
        assert!(p.read && p.write && p.append && !p.execute);
        assert_eq!(p.to_string(), "rwa");
        assert!("rz".parse::<PermissionSet>().is_err());
        assert!("".parse::<PermissionSet>().is_err());
    }

    #[test]
    fn literal_prefix_stops_at_directory_of_first_glob() {
        assert_eq!(rule("/srv/app/data/**", "r").literal_prefix(), Path::new("/srv/app/data/"));
        assert_eq!(rule("/srv/app/log*.txt", "w").literal_prefix(), Path::new("/srv/app/"));
        assert_eq!(rule("/etc/hosts", "r").literal_prefix(), Path::new("/etc/hosts"));
        assert!(rule("/srv/app/{a,b}", "r").is_glob());
    }

    #[test]
    fn normalized_prefix_rejects_parent_components() {
        let r = rule("/srv/app/../../etc/**", "r");
        assert!(matches!(
            r.normalized_prefix(),
            Err(SyswardenError::PolicyScopeViolation { .. })
        ));
        assert_eq!(
            rule("/srv/./app//data/*", "r").normalized_prefix().unwrap(),
            PathBuf::from("/srv/app/data")
        );
    }

    #[test]
    fn relative_patterns_are_rejected() {
        assert!(PathRule::new("data/**", PermissionSet::READ_EXECUTE).is_err());
    }

    #[test]
    fn json_form_round_trips() {
        let profile = PathPermissionProfile::new(vec![
            rule("/srv/app/data/**", "rwa"),
            rule("/srv/app/bin/server", "rx"),
        ]);
        let json = profile.to_json().unwrap();
        assert!(json.contains("\"permissions\": \"rwa\""));
        assert_eq!(PathPermissionProfile::parse(&json).unwrap(), profile);
    }

    #[test]
    fn json_form_validates_patterns() {
        let raw = r#"{ "rules": [{ "pattern": "relative", "permissions": "r" }] }"#;
        assert!(PathPermissionProfile::parse(raw).is_err());
    }
}
