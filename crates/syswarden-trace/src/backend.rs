//! Interception backend abstraction.
//!
//! A [`TraceBackend`] turns a [`TraceTarget`] into a sequence of syscall
//! entries and pushes them into a [`Recorder`]. The recorder owns the
//! session bounds, so backends only have to ask it whether to keep going.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::time::Instant;

use syswarden_common::error::Result;
use syswarden_common::types::SyscallName;

use crate::classify::classify;
use crate::event::{Outcome, StopReason, SyscallEvent};
use crate::session::{StopSignal, TraceLimits, TraceTarget};

/// Collects events for one session and enforces its bounds.
#[derive(Debug)]
pub struct Recorder {
    started: Instant,
    limits: TraceLimits,
    stop: StopSignal,
    reference: Option<BTreeSet<SyscallName>>,
    streams: BTreeMap<u32, Vec<SyscallEvent>>,
    count: u64,
}

impl Recorder {
    /// Creates a recorder. When `reference` is set, events outside it are
    /// marked [`Outcome::WouldDeny`].
    #[must_use]
    pub fn new(
        limits: TraceLimits,
        stop: StopSignal,
        reference: Option<BTreeSet<SyscallName>>,
    ) -> Self {
        Self {
            started: Instant::now(),
            limits,
            stop,
            reference,
            streams: BTreeMap::new(),
            count: 0,
        }
    }

    /// Appends an event to the thread's log.
    ///
    /// The event is always kept; `Break` tells the backend the event cap has
    /// been reached and it should wind down.
    pub fn record(&mut self, pid: u32, tid: u32, syscall: SyscallName) -> ControlFlow<StopReason> {
        let outcome = match &self.reference {
            Some(allowed) if !allowed.contains(&syscall) => Outcome::WouldDeny,
            _ => Outcome::Allowed,
        };
        let timestamp_ns = u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let event = SyscallEvent {
            pid,
            tid,
            arg_class: classify(&syscall),
            syscall,
            timestamp_ns,
            outcome,
        };
        self.streams.entry(tid).or_default().push(event);
        self.count += 1;

        if self.count >= self.limits.max_events {
            ControlFlow::Break(StopReason::EventCap)
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Returns the reason the session should end, if any bound has tripped.
    #[must_use]
    pub fn check(&self) -> Option<StopReason> {
        if self.stop.is_requested() {
            Some(StopReason::Requested)
        } else if self.started.elapsed() >= self.limits.max_duration {
            Some(StopReason::Duration)
        } else if self.count >= self.limits.max_events {
            Some(StopReason::EventCap)
        } else {
            None
        }
    }

    /// Number of events recorded so far.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Time since the recorder was created.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub(crate) fn into_streams(self) -> BTreeMap<u32, Vec<SyscallEvent>> {
        self.streams
    }
}

/// A syscall interception primitive.
pub trait TraceBackend {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Traces `target` until the recorder's bounds trip or the target exits.
    ///
    /// `on_ready` is called once with the target's PID after attachment has
    /// completed, before any workload is driven.
    ///
    /// # Errors
    ///
    /// Returns `TracingUnavailable` if interception is not permitted, or a
    /// process error if the target cannot be started or supervised.
    fn trace(
        &mut self,
        target: &TraceTarget,
        recorder: &mut Recorder,
        on_ready: &mut dyn FnMut(u32),
    ) -> Result<StopReason>;
}

/// A single replayed syscall entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEntry {
    /// Thread-group ID.
    pub pid: u32,
    /// Thread ID.
    pub tid: u32,
    /// Syscall name.
    pub syscall: SyscallName,
}

/// Replays a fixed list of syscall entries, as if they were intercepted.
#[derive(Debug, Clone, Default)]
pub struct ReplayBackend {
    entries: Vec<ReplayEntry>,
}

impl ReplayBackend {
    /// Creates a backend from recorded entries.
    #[must_use]
    pub const fn new(entries: Vec<ReplayEntry>) -> Self {
        Self { entries }
    }

    /// Convenience constructor for a single thread making `names` in order.
    ///
    /// # Errors
    ///
    /// Returns an error if any name is not a valid syscall name.
    pub fn single_thread(pid: u32, names: &[&str]) -> Result<Self> {
        let entries = names
            .iter()
            .map(|n| {
                Ok(ReplayEntry {
                    pid,
                    tid: pid,
                    syscall: SyscallName::new(*n)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(entries))
    }
}

impl TraceBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn trace(
        &mut self,
        _target: &TraceTarget,
        recorder: &mut Recorder,
        on_ready: &mut dyn FnMut(u32),
    ) -> Result<StopReason> {
        on_ready(self.entries.first().map_or(0, |e| e.pid));
        for entry in &self.entries {
            if let Some(reason) = recorder.check() {
                return Ok(reason);
            }
            if let ControlFlow::Break(reason) =
                recorder.record(entry.pid, entry.tid, entry.syscall.clone())
            {
                return Ok(reason);
            }
        }
        Ok(StopReason::TargetExited)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn limits(max_events: u64) -> TraceLimits {
        TraceLimits {
            max_duration: Duration::from_secs(60),
            max_events,
        }
    }

    #[test]
    fn recorder_marks_would_deny_against_reference() {
        let reference: BTreeSet<SyscallName> = [SyscallName::new("read").unwrap()].into();
        let mut rec = Recorder::new(limits(10), StopSignal::new(), Some(reference));
        let _ = rec.record(1, 1, SyscallName::new("read").unwrap());
        let _ = rec.record(1, 1, SyscallName::new("execve").unwrap());

        let streams = rec.into_streams();
        let outcomes: Vec<Outcome> = streams[&1].iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, [Outcome::Allowed, Outcome::WouldDeny]);
    }

    #[test]
    fn recorder_breaks_at_event_cap() {
        let mut rec = Recorder::new(limits(2), StopSignal::new(), None);
        assert!(rec.record(1, 1, SyscallName::new("read").unwrap()).is_continue());
        assert_eq!(
            rec.record(1, 2, SyscallName::new("read").unwrap()),
            ControlFlow::Break(StopReason::EventCap)
        );
        assert_eq!(rec.check(), Some(StopReason::EventCap));
    }

    #[test]
    fn recorder_honours_stop_signal() {
        let stop = StopSignal::new();
        let rec = Recorder::new(limits(10), stop.clone(), None);
        assert!(rec.check().is_none());
        stop.request();
        assert_eq!(rec.check(), Some(StopReason::Requested));
    }

    #[test]
    fn replay_backend_stops_at_cap() {
        let mut backend = ReplayBackend::single_thread(7, &["read", "write", "close"]).unwrap();
        let mut rec = Recorder::new(limits(2), StopSignal::new(), None);
        let mut ready = None;
        let reason = backend
            .trace(&TraceTarget::Attach { pid: 7 }, &mut rec, &mut |pid| ready = Some(pid))
            .unwrap();
        assert_eq!(reason, StopReason::EventCap);
        assert_eq!(ready, Some(7));
        assert_eq!(rec.count(), 2);
    }
}
