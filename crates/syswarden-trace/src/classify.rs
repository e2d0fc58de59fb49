//! Coarse argument classification of syscalls.
//!
//! Raw trace payloads are untyped register values; the tracer only keeps a
//! tag describing what kind of object a syscall operates on.

use serde::{Deserialize, Serialize};
use syswarden_common::types::SyscallName;

/// What a syscall's arguments refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgClass {
    /// No arguments of interest.
    None,
    /// An already open file descriptor.
    Fd,
    /// A filesystem path.
    Path,
    /// A socket or socket address.
    Socket,
    /// Memory mappings or the program break.
    Memory,
    /// Processes, threads or credentials.
    Process,
    /// Signals and signal masks.
    Signal,
    /// Clocks, timers and sleeping.
    Time,
    /// Anything else.
    Other,
}

const PATH: &[&str] = &[
    "access", "chdir", "chmod", "chown", "creat", "execve", "execveat", "faccessat",
    "faccessat2", "fchmodat", "fchownat", "getcwd", "lchown", "link", "linkat", "lstat",
    "mkdir", "mkdirat", "mknod", "mknodat", "newfstatat", "open", "openat", "openat2",
    "readlink", "readlinkat", "rename", "renameat", "renameat2", "rmdir", "stat", "statfs",
    "statx", "symlink", "symlinkat", "truncate", "unlink", "unlinkat", "utimensat",
];

const FD: &[&str] = &[
    "close", "close_range", "dup", "dup2", "dup3", "epoll_create1", "epoll_ctl",
    "epoll_pwait", "epoll_wait", "eventfd2", "fcntl", "fdatasync", "flock", "fstat",
    "fstatfs", "fsync", "ftruncate", "getdents64", "ioctl", "lseek", "pipe", "pipe2",
    "poll", "ppoll", "pread64", "preadv", "pselect6", "pwrite64", "pwritev", "read",
    "readv", "select", "sendfile", "splice", "write", "writev",
];

const SOCKET: &[&str] = &[
    "accept", "accept4", "bind", "connect", "getpeername", "getsockname", "getsockopt",
    "listen", "recv", "recvfrom", "recvmmsg", "recvmsg", "send", "sendmmsg", "sendmsg",
    "sendto", "setsockopt", "shutdown", "socket", "socketpair",
];

const MEMORY: &[&str] = &[
    "brk", "madvise", "membarrier", "mincore", "mlock", "mmap", "mprotect", "mremap",
    "msync", "munlock", "munmap",
];

const PROCESS: &[&str] = &[
    "arch_prctl", "capget", "capset", "clone", "clone3", "exit", "exit_group", "fork",
    "futex", "getegid", "geteuid", "getgid", "getpgid", "getpid", "getppid", "getrlimit",
    "getrusage", "gettid", "getuid", "kill", "prctl", "prlimit64", "rseq", "sched_getaffinity",
    "sched_yield", "set_robust_list", "set_tid_address", "setgid", "setgroups", "setsid",
    "setuid", "tgkill", "tkill", "uname", "vfork", "wait4", "waitid",
];

const SIGNAL: &[&str] = &[
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "rt_sigsuspend", "rt_sigtimedwait",
    "sigaltstack", "signalfd4",
];

const TIME: &[&str] = &[
    "clock_getres", "clock_gettime", "clock_nanosleep", "gettimeofday", "nanosleep",
    "time", "timer_create", "timer_settime", "timerfd_create", "timerfd_settime",
];

/// Classifies a syscall by name.
#[must_use]
pub fn classify(name: &SyscallName) -> ArgClass {
    let n = name.as_str();
    let tables: [(&[&str], ArgClass); 7] = [
        (PATH, ArgClass::Path),
        (SOCKET, ArgClass::Socket),
        (FD, ArgClass::Fd),
        (MEMORY, ArgClass::Memory),
        (PROCESS, ArgClass::Process),
        (SIGNAL, ArgClass::Signal),
        (TIME, ArgClass::Time),
    ];
    for (table, class) in tables {
        if table.contains(&n) {
            return class;
        }
    }
    match n {
        "getrandom" | "sysinfo" | "sync" => ArgClass::None,
        _ => ArgClass::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class_of(name: &str) -> ArgClass {
        classify(&SyscallName::new(name).unwrap())
    }

    #[test]
    fn classifies_common_calls() {
        assert_eq!(class_of("openat"), ArgClass::Path);
        assert_eq!(class_of("accept4"), ArgClass::Socket);
        assert_eq!(class_of("write"), ArgClass::Fd);
        assert_eq!(class_of("mmap"), ArgClass::Memory);
        assert_eq!(class_of("exit_group"), ArgClass::Process);
        assert_eq!(class_of("rt_sigreturn"), ArgClass::Signal);
        assert_eq!(class_of("clock_gettime"), ArgClass::Time);
    }

    #[test]
    fn unknown_calls_are_other() {
        assert_eq!(class_of("io_uring_setup"), ArgClass::Other);
        assert_eq!(class_of("getrandom"), ArgClass::None);
    }
}
