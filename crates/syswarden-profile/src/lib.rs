//! # syswarden-profile
//!
//! Turns observed syscall usage into seccomp filter profiles.
//!
//! - **Usage / Aggregator**: union of syscall usage across trace runs, with
//!   a coverage-delta metric per run.
//! - **Synthesizer**: deterministic, monotonic allow-list synthesis on top
//!   of a fixed startup/teardown baseline.
//! - **Filter**: the versioned, Docker-compatible profile document.
//! - **Minimize / Diff**: elimination testing and version-to-version diffs.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod aggregator;
pub mod baseline;
pub mod diff;
pub mod filter;
pub mod minimize;
pub mod synthesizer;
pub mod usage;
