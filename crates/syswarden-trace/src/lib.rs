//! # syswarden-trace
//!
//! Observes a running service and records the syscalls it makes.
//!
//! - **Backend**: the interception primitive, behind [`backend::TraceBackend`].
//!   [`ptrace::PtraceBackend`] is the Linux implementation; [`backend::ReplayBackend`]
//!   replays recorded events.
//! - **Session**: bounds a trace by duration, event count, or an explicit stop
//!   signal, and collects per-thread event logs.
//! - **Scenario**: drives a representative workload against the target while
//!   the trace is running.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod classify;
pub mod event;
#[cfg(target_os = "linux")]
pub mod ptrace;
pub mod resolve;
pub mod scenario;
pub mod session;
