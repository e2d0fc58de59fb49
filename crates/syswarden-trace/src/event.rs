//! Recorded syscall events and trace recordings.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use syswarden_common::types::{SessionId, SyscallName};

use crate::classify::ArgClass;

/// Whether a syscall would pass the reference filter the session was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// Allowed, or no reference filter was supplied.
    Allowed,
    /// Not in the reference filter's allow-list.
    WouldDeny,
}

/// A captured syscall entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallEvent {
    /// Thread-group (process) ID.
    pub pid: u32,
    /// Thread ID that made the call.
    pub tid: u32,
    /// Syscall name.
    pub syscall: SyscallName,
    /// Coarse classification of the syscall's arguments.
    pub arg_class: ArgClass,
    /// Nanoseconds since the session started.
    pub timestamp_ns: u64,
    /// Outcome against the session's reference filter.
    pub outcome: Outcome,
}

/// Why a trace session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// The configured wall-clock duration elapsed.
    Duration,
    /// The configured event-count cap was reached.
    EventCap,
    /// An explicit stop was requested (operator or scenario completion).
    Requested,
    /// Every traced thread exited.
    TargetExited,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duration => write!(f, "duration elapsed"),
            Self::EventCap => write!(f, "event cap reached"),
            Self::Requested => write!(f, "stop requested"),
            Self::TargetExited => write!(f, "target exited"),
        }
    }
}

/// The result of one trace session: an append-only event log per thread.
///
/// Logs of different threads are independent; only the union of syscalls
/// they contain is meaningful across threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecording {
    /// Session identifier.
    pub session: SessionId,
    /// Display form of the traced target.
    pub target: String,
    /// Per-thread event logs keyed by thread ID.
    pub streams: BTreeMap<u32, Vec<SyscallEvent>>,
    /// Why the session ended.
    pub stop_reason: StopReason,
    /// Total number of recorded events.
    pub event_count: u64,
    /// Wall-clock duration of the session, in milliseconds.
    pub duration_ms: u64,
    /// Failure reported by the scenario driver, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_failure: Option<String>,
}

impl TraceRecording {
    /// Returns the distinct syscalls seen across all threads.
    #[must_use]
    pub fn syscalls(&self) -> BTreeSet<SyscallName> {
        self.events().map(|e| e.syscall.clone()).collect()
    }

    /// Returns the distinct syscalls the reference filter would have denied.
    #[must_use]
    pub fn would_deny(&self) -> BTreeSet<SyscallName> {
        self.events()
            .filter(|e| e.outcome == Outcome::WouldDeny)
            .map(|e| e.syscall.clone())
            .collect()
    }

    /// Iterates over every event, thread by thread.
    pub fn events(&self) -> impl Iterator<Item = &SyscallEvent> {
        self.streams.values().flatten()
    }

    /// Number of threads that produced at least one event.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.streams.len()
    }
}
