//! Syscalls every process needs to start and exit.
//!
//! The dynamic loader maps and reads shared libraries, libc sets up thread
//! state and signal handling, and every process ends in `exit_group`. These
//! are allowed regardless of what a trace observed.

use std::collections::BTreeSet;

use syswarden_common::types::SyscallName;

/// Startup/teardown allow-list, sorted.
pub const BASELINE: &[&str] = &[
    "access",
    "arch_prctl",
    "brk",
    "close",
    "execve",
    "exit",
    "exit_group",
    "fstat",
    "futex",
    "getrandom",
    "mmap",
    "mprotect",
    "munmap",
    "newfstatat",
    "openat",
    "pread64",
    "prlimit64",
    "read",
    "rseq",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "set_robust_list",
    "set_tid_address",
];

/// Returns the baseline as syscall names.
#[must_use]
pub fn baseline() -> BTreeSet<SyscallName> {
    BASELINE
        .iter()
        .filter_map(|n| SyscallName::new(*n).ok())
        .collect()
}

/// Returns `true` if `name` is part of the baseline.
#[must_use]
pub fn is_baseline(name: &SyscallName) -> bool {
    BASELINE.binary_search(&name.as_str()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_is_sorted_and_unique() {
        assert!(BASELINE.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(baseline().len(), BASELINE.len());
    }

    #[test]
    fn baseline_covers_exec_and_exit() {
        for name in ["execve", "exit_group", "mmap", "brk"] {
            assert!(is_baseline(&SyscallName::new(name).unwrap()), "{name}");
        }
        assert!(!is_baseline(&SyscallName::new("accept").unwrap()));
    }
}
