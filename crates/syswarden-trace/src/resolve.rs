//! Syscall number to name resolution for the native architecture.

use std::collections::HashMap;

use syswarden_common::types::SyscallName;

/// Caches syscall number lookups.
///
/// On Linux names come from libseccomp's architecture tables. Numbers the
/// table does not know resolve to `syscall_<nr>` so they are still recorded.
#[derive(Debug, Default)]
pub struct SyscallResolver {
    cache: HashMap<i64, SyscallName>,
}

impl SyscallResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a syscall number. Negative numbers are not syscalls.
    pub fn name(&mut self, nr: i64) -> Option<SyscallName> {
        if nr < 0 {
            return None;
        }
        if let Some(name) = self.cache.get(&nr) {
            return Some(name.clone());
        }
        let name = lookup(nr).unwrap_or_else(|| fallback(nr));
        let _ = self.cache.insert(nr, name.clone());
        Some(name)
    }
}

/// Resolves a syscall name to its native number.
#[cfg(target_os = "linux")]
#[must_use]
pub fn number_of(name: &SyscallName) -> Option<i32> {
    libseccomp::ScmpSyscall::from_name(name.as_str())
        .ok()
        .map(i32::from)
}

/// Resolves a syscall name to its native number.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn number_of(_name: &SyscallName) -> Option<i32> {
    None
}

#[cfg(target_os = "linux")]
fn lookup(nr: i64) -> Option<SyscallName> {
    let nr = i32::try_from(nr).ok()?;
    let name = libseccomp::ScmpSyscall::from(nr).get_name().ok()?;
    SyscallName::new(name).ok()
}

#[cfg(not(target_os = "linux"))]
const fn lookup(_nr: i64) -> Option<SyscallName> {
    None
}

fn fallback(nr: i64) -> SyscallName {
    SyscallName::new(format!("syscall_{nr}")).unwrap_or_else(|_| unreachable!("digits are valid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_numbers_are_not_syscalls() {
        let mut r = SyscallResolver::new();
        assert!(r.name(-1).is_none());
    }

    #[test]
    fn lookups_are_cached_and_stable() {
        let mut r = SyscallResolver::new();
        let a = r.name(0).unwrap();
        let b = r.name(0).unwrap();
        assert_eq!(a, b);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn resolves_native_numbers() {
        let mut r = SyscallResolver::new();
        assert_eq!(r.name(0).unwrap().as_str(), "read");
        assert_eq!(r.name(59).unwrap().as_str(), "execve");
        let execve = SyscallName::new("execve").unwrap();
        assert_eq!(number_of(&execve), Some(59));
    }

    #[test]
    fn unknown_number_falls_back() {
        assert_eq!(fallback(9999).as_str(), "syscall_9999");
    }
}
