//! On-disk bundle directories.
//!
//! A bundle directory holds `filter.json`, `paths.json` and the
//! `bundle.json` manifest. Every file is written to a temporary file in the
//! same directory and renamed into place; the manifest goes last, so a
//! directory without a manifest is never mistaken for a complete bundle.

use std::io::Write;
use std::path::{Path, PathBuf};

use syswarden_common::constants::BUNDLE_MANIFEST;
use syswarden_common::error::{Result, SyswardenError};
use syswarden_common::types::Sha256Hash;

use crate::bundle::{BundleManifest, PolicyBundle, is_plain_file_name, verify_artifacts};

/// A bundle directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleStore {
    dir: PathBuf,
}

impl BundleStore {
    /// Refers to the bundle directory `dir`; nothing is touched yet.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The bundle directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `bundle`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if any file cannot be written.
    pub fn write(&self, bundle: &PolicyBundle) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| SyswardenError::io(&self.dir, e))?;
        let manifest = bundle.manifest();
        self.write_atomic(&manifest.filter, bundle.filter_bytes().as_bytes())?;
        self.write_atomic(&manifest.paths, bundle.paths_bytes().as_bytes())?;
        let mut json = serde_json::to_string_pretty(manifest)?;
        json.push('\n');
        self.write_atomic(BUNDLE_MANIFEST, json.as_bytes())?;
        tracing::info!(
            dir = %self.dir.display(),
            checksum = %manifest.checksum,
            "policy bundle written"
        );
        Ok(())
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let final_path = self.dir.join(name);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| SyswardenError::io(&self.dir, e))?;
        tmp.write_all(bytes)
            .map_err(|e| SyswardenError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| SyswardenError::io(tmp.path(), e))?;
        let _ = tmp
            .persist(&final_path)
            .map_err(|e| SyswardenError::io(&final_path, e.error))?;
        Ok(())
    }

    fn read(&self, name: &str) -> Result<String> {
        if !is_plain_file_name(name) {
            return Err(SyswardenError::Parse {
                what: "bundle manifest",
                message: format!("artifact reference '{name}' is not a plain file name"),
            });
        }
        let path = self.dir.join(name);
        std::fs::read_to_string(&path).map_err(|e| SyswardenError::io(&path, e))
    }

    fn read_manifest(&self) -> Result<BundleManifest> {
        let path = self.dir.join(BUNDLE_MANIFEST);
        if !path.exists() {
            return Err(SyswardenError::NotFound {
                kind: "policy bundle",
                id: self.dir.display().to_string(),
            });
        }
        Ok(serde_json::from_str(&self.read(BUNDLE_MANIFEST)?)?)
    }

    /// Recomputes the checksum from the files on disk.
    ///
    /// Returns the verified checksum.
    ///
    /// # Errors
    ///
    /// Returns `BundleChecksumMismatch` if any artifact or the target
    /// identity changed since assembly, `NotFound` if there is no manifest.
    pub fn verify(&self) -> Result<Sha256Hash> {
        let manifest = self.read_manifest()?;
        let filter = self.read(&manifest.filter)?;
        let paths = self.read(&manifest.paths)?;
        verify_artifacts(&manifest, &filter, &paths)?;
        Ok(manifest.checksum)
    }

    /// Loads and verifies the bundle.
    ///
    /// The checksum is checked before the artifacts are parsed.
    ///
    /// # Errors
    ///
    /// Returns `BundleChecksumMismatch` on tampering, or read/parse errors.
    pub fn load(&self) -> Result<PolicyBundle> {
        let manifest = self.read_manifest()?;
        let filter = self.read(&manifest.filter)?;
        let paths = self.read(&manifest.paths)?;
        verify_artifacts(&manifest, &filter, &paths)?;
        tracing::debug!(
            dir = %self.dir.display(),
            checksum = %manifest.checksum,
            "policy bundle loaded"
        );
        PolicyBundle::from_parts(manifest, filter, paths)
    }
}
