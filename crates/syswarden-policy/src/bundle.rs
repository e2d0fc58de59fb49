//! Policy bundle assembly.
//!
//! A bundle ties a filter profile and a path-permission profile to the
//! target they were built for. It is immutable once assembled: changing
//! policy means assembling a new bundle and restarting the process.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use syswarden_common::constants::{BUNDLE_FILTER, BUNDLE_PATHS};
use syswarden_common::error::{Result, SyswardenError};
use syswarden_common::types::{Sha256Hash, TargetIdentity};
use syswarden_profile::filter::FilterProfile;

use crate::checksum::bundle_checksum;
use crate::paths::{PathPermissionProfile, normalize};

/// The `bundle.json` manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// File name of the filter profile inside the bundle directory.
    pub filter: String,
    /// File name of the path profile inside the bundle directory.
    pub paths: String,
    /// Version of the referenced filter profile.
    pub filter_version: u32,
    /// Target the bundle was built for.
    pub target: TargetIdentity,
    /// Creation time; not covered by the checksum.
    pub created_at: DateTime<Utc>,
    /// Checksum over the referenced artifacts and the target identity.
    pub checksum: Sha256Hash,
}

/// An assembled bundle with its artifacts in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBundle {
    manifest: BundleManifest,
    filter: FilterProfile,
    paths: PathPermissionProfile,
    filter_bytes: String,
    paths_bytes: String,
}

impl PolicyBundle {
    pub(crate) fn from_parts(
        manifest: BundleManifest,
        filter_bytes: String,
        paths_bytes: String,
    ) -> Result<Self> {
        let filter = FilterProfile::from_json(&filter_bytes)?;
        let paths = PathPermissionProfile::parse(&paths_bytes)?;
        Ok(Self {
            manifest,
            filter,
            paths,
            filter_bytes,
            paths_bytes,
        })
    }

    /// Manifest.
    #[must_use]
    pub const fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// Filter profile.
    #[must_use]
    pub const fn filter(&self) -> &FilterProfile {
        &self.filter
    }

    /// Path-permission profile.
    #[must_use]
    pub const fn paths(&self) -> &PathPermissionProfile {
        &self.paths
    }

    /// Target identity.
    #[must_use]
    pub const fn target(&self) -> &TargetIdentity {
        &self.manifest.target
    }

    /// Recorded checksum.
    #[must_use]
    pub const fn checksum(&self) -> &Sha256Hash {
        &self.manifest.checksum
    }

    /// Canonical filter bytes, as stored in the bundle.
    #[must_use]
    pub fn filter_bytes(&self) -> &str {
        &self.filter_bytes
    }

    /// Canonical path profile bytes, as stored in the bundle.
    #[must_use]
    pub fn paths_bytes(&self) -> &str {
        &self.paths_bytes
    }

    /// Recomputes the checksum from the artifacts and compares it with the
    /// manifest.
    ///
    /// # Errors
    ///
    /// Returns `BundleChecksumMismatch` if they differ.
    pub fn verify(&self) -> Result<()> {
        verify_artifacts(&self.manifest, &self.filter_bytes, &self.paths_bytes)
    }

    /// Replaces the manifest without recomputing anything.
    ///
    /// The result generally fails [`verify`](Self::verify); used to check
    /// that tampering is caught.
    #[must_use]
    pub fn with_manifest(mut self, manifest: BundleManifest) -> Self {
        self.manifest = manifest;
        self
    }
}

pub(crate) fn verify_artifacts(
    manifest: &BundleManifest,
    filter: &str,
    paths: &str,
) -> Result<()> {
    let actual = bundle_checksum(filter.as_bytes(), paths.as_bytes(), &manifest.target);
    if actual == manifest.checksum {
        Ok(())
    } else {
        tracing::error!(expected = %manifest.checksum, %actual, "bundle checksum mismatch");
        Err(SyswardenError::BundleChecksumMismatch {
            expected: manifest.checksum.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Checks that every path rule lies within one of `app_roots`.
///
/// # Errors
///
/// Returns `PolicyScopeViolation` for the first rule outside every root or
/// containing a `..` component, and `Config` for relative roots.
pub fn check_scope(paths: &PathPermissionProfile, app_roots: &[PathBuf]) -> Result<()> {
    let roots = app_roots
        .iter()
        .map(|r| {
            if r.is_absolute() && !r.components().any(|c| matches!(c, Component::ParentDir)) {
                Ok(normalize(r))
            } else {
                Err(SyswardenError::Config {
                    message: format!(
                        "application root {} must be absolute without '..'",
                        r.display()
                    ),
                })
            }
        })
        .collect::<Result<Vec<_>>>()?;

    for rule in &paths.rules {
        let within = rule
            .normalized_prefix()
            .is_ok_and(|prefix| roots.iter().any(|root| prefix.starts_with(root)));
        if !within {
            return Err(SyswardenError::PolicyScopeViolation {
                pattern: rule.pattern.clone(),
                roots: app_roots.to_vec(),
            });
        }
    }
    Ok(())
}

/// Assembles a bundle.
///
/// # Errors
///
/// Returns `PolicyScopeViolation` if a path rule escapes the application
/// roots, or serialization errors.
pub fn assemble(
    filter: &FilterProfile,
    paths: &PathPermissionProfile,
    target: TargetIdentity,
    app_roots: &[PathBuf],
) -> Result<PolicyBundle> {
    check_scope(paths, app_roots)?;

    let filter_bytes = filter.to_json()?;
    let paths_bytes = paths.to_json()?;
    let checksum = bundle_checksum(filter_bytes.as_bytes(), paths_bytes.as_bytes(), &target);
    tracing::info!(
        target = %target,
        filter_version = filter.version(),
        path_rules = paths.rules.len(),
        checksum = %checksum,
        "assembled policy bundle"
    );

    Ok(PolicyBundle {
        manifest: BundleManifest {
            filter: BUNDLE_FILTER.into(),
            paths: BUNDLE_PATHS.into(),
            filter_version: filter.version(),
            target,
            created_at: Utc::now(),
            checksum,
        },
        filter: filter.clone(),
        paths: paths.clone(),
        filter_bytes,
        paths_bytes,
    })
}

/// Returns `true` if `path` is one of the plain file names a manifest may
/// reference.
pub(crate) fn is_plain_file_name(name: &str) -> bool {
    let p = Path::new(name);
    !name.is_empty() && p.file_name().is_some_and(|f| f == p.as_os_str())
}
