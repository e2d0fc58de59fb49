//! Bounded trace sessions.
//!
//! A session runs a backend against a target while an optional scenario
//! driver exercises the workload on its own thread. The session ends on the
//! first of: duration elapsed, event cap reached, stop requested (by the
//! operator or by the scenario finishing), or the target exiting.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use syswarden_common::config::TraceConfig;
use syswarden_common::error::Result;
use syswarden_common::types::{SessionId, SyscallName};

use crate::backend::{Recorder, TraceBackend};
use crate::event::TraceRecording;
use crate::scenario::ScenarioDriver;

/// What to trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceTarget {
    /// Start a new process under the tracer.
    Spawn {
        /// Executable to run.
        program: PathBuf,
        /// Arguments passed to the executable.
        args: Vec<String>,
        /// Extra environment variables.
        env: Vec<(String, String)>,
    },
    /// Attach to an already running process and all of its threads.
    Attach {
        /// PID of the process.
        pid: u32,
    },
}

impl fmt::Display for TraceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { program, args, .. } => {
                write!(f, "{}", program.display())?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
            Self::Attach { pid } => write!(f, "pid {pid}"),
        }
    }
}

/// Upper bounds on a trace session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceLimits {
    /// Maximum wall-clock duration.
    pub max_duration: Duration,
    /// Maximum number of recorded events.
    pub max_events: u64,
}

impl From<&TraceConfig> for TraceLimits {
    fn from(config: &TraceConfig) -> Self {
        Self {
            max_duration: Duration::from_secs(config.max_duration_secs),
            max_events: config.max_events,
        }
    }
}

impl Default for TraceLimits {
    fn default() -> Self {
        Self::from(&TraceConfig::default())
    }
}

/// Shared flag used to end a session early.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Creates an unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the session to stop at the next opportunity.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once a stop has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A configured trace session.
#[derive(Debug)]
pub struct TraceSession {
    id: SessionId,
    limits: TraceLimits,
    reference: Option<BTreeSet<SyscallName>>,
    stop: StopSignal,
}

impl TraceSession {
    /// Creates a session with the given bounds.
    #[must_use]
    pub fn new(limits: TraceLimits) -> Self {
        Self {
            id: SessionId::generate(),
            limits,
            reference: None,
            stop: StopSignal::new(),
        }
    }

    /// Marks events outside `allowed` as would-deny, e.g. when re-tracing a
    /// service against the allow-list of its current profile.
    #[must_use]
    pub fn with_reference(mut self, allowed: BTreeSet<SyscallName>) -> Self {
        self.reference = Some(allowed);
        self
    }

    /// Returns the session identifier.
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns a handle that ends the session when requested.
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Runs the session to completion.
    ///
    /// When a scenario is given it starts on its own thread once the target
    /// is attached; its completion requests a stop. A failing scenario does
    /// not fail the session, but is recorded in
    /// [`TraceRecording::scenario_failure`].
    ///
    /// # Errors
    ///
    /// Propagates backend failures, including `TracingUnavailable`.
    pub fn run(
        &self,
        backend: &mut dyn TraceBackend,
        target: &TraceTarget,
        scenario: Option<Arc<dyn ScenarioDriver>>,
    ) -> Result<TraceRecording> {
        tracing::info!(
            session = %self.id,
            backend = backend.name(),
            target = %target,
            max_events = self.limits.max_events,
            max_duration_ms = u64::try_from(self.limits.max_duration.as_millis()).unwrap_or(u64::MAX),
            "starting trace session"
        );

        let mut recorder = Recorder::new(self.limits, self.stop.clone(), self.reference.clone());
        let mut driver: Option<JoinHandle<Result<()>>> = None;
        let mut on_ready = |pid: u32| {
            if let Some(scenario) = scenario.clone() {
                let stop = self.stop.clone();
                tracing::info!(pid, scenario = scenario.name(), "driving workload scenario");
                driver = Some(std::thread::spawn(move || {
                    let result = scenario.drive(pid);
                    stop.request();
                    result
                }));
            }
        };

        let outcome = backend.trace(target, &mut recorder, &mut on_ready);
        self.stop.request();
        let scenario_failure = join_driver(driver);
        let stop_reason = outcome?;

        let event_count = recorder.count();
        let duration_ms = u64::try_from(recorder.elapsed().as_millis()).unwrap_or(u64::MAX);
        let streams = recorder.into_streams();
        tracing::info!(
            session = %self.id,
            events = event_count,
            threads = streams.len(),
            reason = %stop_reason,
            "trace session finished"
        );

        Ok(TraceRecording {
            session: self.id.clone(),
            target: target.to_string(),
            streams,
            stop_reason,
            event_count,
            duration_ms,
            scenario_failure,
        })
    }
}

fn join_driver(driver: Option<JoinHandle<Result<()>>>) -> Option<String> {
    let handle = driver?;
    match handle.join() {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "scenario driver failed; coverage may be incomplete");
            Some(e.to_string())
        }
        Err(_) => {
            tracing::warn!("scenario driver panicked");
            Some("scenario driver panicked".into())
        }
    }
}
