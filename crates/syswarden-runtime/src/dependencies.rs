//! Files the dynamic loader needs to start an executable.
//!
//! Under Landlock the loader itself is confined, so the executable, its
//! interpreter and every shared library it links must be readable and
//! executable.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Loader cache consulted before the default library directories.
const LD_SO_CACHE: &str = "/etc/ld.so.cache";

/// Paths that must stay readable and executable for `executable` to start.
///
/// Always contains the executable itself. A file `lddtree` cannot analyze
/// (a script, a static binary) contributes only itself; for a script the
/// interpreter named on its `#!` line is analyzed instead.
#[must_use]
pub fn runtime_paths(executable: &Path) -> BTreeSet<PathBuf> {
    let mut paths = BTreeSet::new();
    let _ = paths.insert(executable.to_path_buf());
    let loader_cache = Path::new(LD_SO_CACHE);
    if loader_cache.exists() {
        let _ = paths.insert(loader_cache.to_path_buf());
    }

    let target = match analyze(executable) {
        Ok(tree) => Some(tree),
        Err(e) => match shebang_interpreter(executable) {
            Some(interpreter) => {
                tracing::debug!(
                    executable = %executable.display(),
                    interpreter = %interpreter.display(),
                    "analyzing script interpreter"
                );
                let _ = paths.insert(interpreter.clone());
                analyze(&interpreter).ok()
            }
            None => {
                tracing::debug!(
                    executable = %executable.display(),
                    error = %e,
                    "no ELF dependencies"
                );
                None
            }
        },
    };

    if let Some(tree) = target {
        if let Some(interp) = tree.interpreter {
            let _ = paths.insert(PathBuf::from(interp));
        }
        for lib in tree.libraries.values() {
            match &lib.realpath {
                Some(real) => {
                    let _ = paths.insert(real.clone());
                    if real != &lib.path {
                        let _ = paths.insert(lib.path.clone());
                    }
                }
                None => tracing::warn!(library = %lib.name, "shared library not found"),
            }
        }
    }
    tracing::debug!(
        executable = %executable.display(),
        paths = paths.len(),
        "runtime paths resolved"
    );
    paths
}

/// `analyze` consumes the analyzer, so each lookup gets its own.
fn analyze(path: &Path) -> Result<lddtree::DependencyTree, lddtree::Error> {
    lddtree::DependencyAnalyzer::new(PathBuf::from("/")).analyze(path)
}

/// The interpreter of a `#!` script, if `path` is one.
fn shebang_interpreter(path: &Path) -> Option<PathBuf> {
    use std::io::Read as _;

    let mut head = [0u8; 256];
    let n = std::fs::File::open(path).ok()?.read(&mut head).ok()?;
    let text = std::str::from_utf8(&head[..n]).ok()?;
    let first = text.strip_prefix("#!")?.lines().next()?;
    let interpreter = first.split_whitespace().next()?;
    Some(PathBuf::from(interpreter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ls_needs_its_libraries() {
        let ls = which::which("ls").unwrap();
        let paths = runtime_paths(&ls);
        assert!(paths.contains(&ls));
        assert!(paths.len() > 1, "{paths:?}");
        assert!(paths.iter().all(|p| p.is_absolute()));
    }

    #[test]
    fn script_contributes_its_interpreter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh -e\necho hi\n").unwrap();

        assert_eq!(shebang_interpreter(&script), Some(PathBuf::from("/bin/sh")));
        let paths = runtime_paths(&script);
        assert!(paths.contains(&script));
        assert!(paths.contains(Path::new("/bin/sh")));
    }

    #[test]
    fn plain_file_contributes_only_itself() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("data.bin");
        std::fs::write(&data, [0u8; 16]).unwrap();
        assert!(shebang_interpreter(&data).is_none());
        assert!(runtime_paths(&data).contains(&data));
    }
}
