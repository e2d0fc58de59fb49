//! SHA-256 checksums of bundle artifacts and executables.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use syswarden_common::error::{Result, SyswardenError};
use syswarden_common::types::{Sha256Hash, TargetIdentity};

const DOMAIN: &[u8] = b"syswarden/policy-bundle/v1";

fn field(hasher: &mut Sha256, tag: &[u8], bytes: &[u8]) {
    hasher.update((tag.len() as u64).to_be_bytes());
    hasher.update(tag);
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Checksum of a bundle's contents.
///
/// Each input is length-prefixed and tagged, so moving bytes between fields
/// changes the result. The bundle's creation time is not an input.
#[must_use]
pub fn bundle_checksum(
    filter_bytes: &[u8],
    paths_bytes: &[u8],
    target: &TargetIdentity,
) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN);
    field(&mut hasher, b"filter", filter_bytes);
    field(&mut hasher, b"paths", paths_bytes);
    field(&mut hasher, b"target.name", target.name.as_bytes());
    field(
        &mut hasher,
        b"target.executable",
        target.executable.to_string_lossy().as_bytes(),
    );
    field(
        &mut hasher,
        b"target.digest",
        target.digest.as_ref().map_or("", Sha256Hash::as_hex).as_bytes(),
    );
    Sha256Hash::from_digest(&hasher.finalize())
}

/// Computes the SHA-256 digest of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<Sha256Hash> {
    tracing::debug!(path = %path.display(), "computing SHA-256 hash");
    let mut file = std::fs::File::open(path).map_err(|e| SyswardenError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| SyswardenError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Sha256Hash::from_digest(&hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetIdentity {
        TargetIdentity::new("web", "/usr/bin/python3")
    }

    #[test]
    fn checksum_is_deterministic() {
        let a = bundle_checksum(b"{}", b"[]", &target());
        let b = bundle_checksum(b"{}", b"[]", &target());
        assert_eq!(a, b);
        assert_eq!(a.as_hex().len(), 64);
    }

    #[test]
    fn fields_are_separated() {
        let a = bundle_checksum(b"ab", b"c", &target());
        let b = bundle_checksum(b"a", b"bc", &target());
        assert_ne!(a, b);
    }

    #[test]
    fn target_identity_is_covered() {
        let a = bundle_checksum(b"{}", b"[]", &target());
        let b = bundle_checksum(b"{}", b"[]", &TargetIdentity::new("web", "/usr/bin/python3.12"));
        assert_ne!(a, b);
    }

    #[test]
    fn hash_file_matches_known_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hello");
        std::fs::write(&path, b"hello").expect("write");
        assert_eq!(
            hash_file(&path).unwrap().as_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn hash_file_reports_missing_path() {
        assert!(matches!(
            hash_file(Path::new("/nonexistent/binary")),
            Err(SyswardenError::Io { .. })
        ));
    }
}
