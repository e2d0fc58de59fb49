//! # syswarden-runtime
//!
//! Starts a target under a verified policy bundle and watches it.
//!
//! - **Launcher**: verifies the bundle checksum and the executable digest,
//!   then installs the Landlock ruleset and the seccomp filter in the child
//!   right before `execve`. Policy is installed exactly once; the returned
//!   handle has no way to change it.
//! - **Monitor**: polls the child on its own thread and tells a kernel
//!   policy kill apart from an ordinary exit. It also follows the audit
//!   trail for kills of worker processes forked below the child, and uses
//!   it to name the offending syscall.
//! - **Violations**: JSON-lines log of policy kills, read back as synthesis
//!   hints.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

#[cfg(target_os = "linux")]
pub mod audit;
#[cfg(target_os = "linux")]
pub mod dependencies;
#[cfg(target_os = "linux")]
pub mod jail;
#[cfg(target_os = "linux")]
pub mod launcher;
#[cfg(target_os = "linux")]
pub mod monitor;
#[cfg(target_os = "linux")]
pub mod probe;
#[cfg(target_os = "linux")]
pub mod seccomp;
#[cfg(target_os = "linux")]
pub mod tree;
pub mod violations;
