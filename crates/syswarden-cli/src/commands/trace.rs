//! `swd trace` — Record the syscalls a service makes.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use syswarden_common::config::SyswardenConfig;
use syswarden_profile::aggregator::Aggregator;
use syswarden_profile::filter::FilterProfile;
use syswarden_trace::event::TraceRecording;
use syswarden_trace::ptrace::{self, PtraceBackend};
use syswarden_trace::session::{TraceLimits, TraceSession, TraceTarget};

use super::ScenarioArgs;
use crate::output::{
    BOLD, CYAN, DIM, GREEN, RESET, YELLOW, format_duration_ms, format_percent, join_names,
};

/// Arguments for the `trace` command.
#[derive(Args, Debug)]
pub struct TraceArgs {
    /// Attach to a running process instead of starting one.
    #[arg(long, conflicts_with = "command")]
    pub pid: Option<u32>,

    /// Where the merged usage set is written.
    #[arg(short, long, default_value = "usage.json")]
    pub out: PathBuf,

    /// Aggregator state carried across runs; created if missing.
    #[arg(long)]
    pub state: Option<PathBuf>,

    /// Also write the raw per-thread recording here.
    #[arg(long)]
    pub recording: Option<PathBuf>,

    /// Existing filter profile; calls it would deny are flagged.
    #[arg(long)]
    pub reference: Option<PathBuf>,

    /// Maximum session duration in seconds (overrides the configuration).
    #[arg(long)]
    pub duration: Option<u64>,

    /// Maximum number of recorded events (overrides the configuration).
    #[arg(long)]
    pub max_events: Option<u64>,

    #[command(flatten)]
    pub scenario: ScenarioArgs,

    /// Program and arguments to start under the tracer.
    #[arg(last = true)]
    pub command: Vec<String>,
}

impl TraceArgs {
    fn target(&self) -> anyhow::Result<TraceTarget> {
        if let Some(pid) = self.pid {
            return Ok(TraceTarget::Attach { pid });
        }
        let Some((program, args)) = self.command.split_first() else {
            anyhow::bail!(
                "Nothing to trace.\n\
                 Use: swd trace --pid <PID>  or  swd trace -- <program> [args]"
            );
        };
        Ok(TraceTarget::Spawn {
            program: PathBuf::from(program),
            args: args.to_vec(),
            env: Vec::new(),
        })
    }

    fn limits(&self, config: &SyswardenConfig) -> anyhow::Result<TraceLimits> {
        let mut limits = TraceLimits::from(&config.trace);
        if let Some(secs) = self.duration {
            anyhow::ensure!(secs > 0, "--duration must be greater than zero");
            limits.max_duration = Duration::from_secs(secs);
        }
        if let Some(events) = self.max_events {
            anyhow::ensure!(events > 0, "--max-events must be greater than zero");
            limits.max_events = events;
        }
        Ok(limits)
    }
}

/// Executes the `trace` command.
///
/// # Errors
///
/// Returns an error if ptrace is unavailable, the target cannot be traced,
/// or the usage set cannot be written.
pub fn execute(args: TraceArgs, config: &SyswardenConfig) -> anyhow::Result<()> {
    let target = args.target()?;
    let limits = args.limits(config)?;
    let scenario = args.scenario.driver()?;
    ptrace::check_available().map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut session = TraceSession::new(limits);
    if let Some(path) = &args.reference {
        let reference = FilterProfile::load(path).map_err(|e| anyhow::anyhow!("{e}"))?;
        session = session.with_reference(reference.allowlist());
    }
    let stop = session.stop_signal();
    ctrlc::set_handler(move || stop.request())
        .map_err(|e| anyhow::anyhow!("Failed to set Ctrl+C handler: {e}"))?;

    eprintln!();
    eprintln!("  {BOLD}Tracing{RESET} {CYAN}{target}{RESET}");
    eprintln!(
        "  {DIM}up to {} or {} events, Ctrl+C to stop{RESET}",
        format_duration_ms(u64::try_from(limits.max_duration.as_millis()).unwrap_or(u64::MAX)),
        limits.max_events
    );

    let mut backend = PtraceBackend::new();
    let recording = session
        .run(&mut backend, &target, scenario)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    if let Some(path) = &args.recording {
        let json = serde_json::to_string_pretty(&recording)?;
        std::fs::write(path, json)
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", path.display()))?;
    }

    let mut aggregator = match &args.state {
        Some(path) if path.exists() => {
            Aggregator::load(path).map_err(|e| anyhow::anyhow!("{e}"))?
        }
        _ => Aggregator::new(target.to_string()),
    };
    let coverage = aggregator.ingest(recording.session.to_string(), &recording).clone();
    if let Some(path) = &args.state {
        aggregator.save(path).map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    aggregator
        .usage()
        .save(&args.out)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    print_summary(&recording);
    eprintln!(
        "  {GREEN}✓{RESET} run {}: {} new, {} total, coverage delta {}",
        coverage.run,
        coverage.discovered.len(),
        coverage.total,
        format_percent(coverage.delta)
    );
    eprintln!("  {DIM}usage set written to {}{RESET}", args.out.display());
    Ok(())
}

fn print_summary(recording: &TraceRecording) {
    eprintln!();
    eprintln!(
        "  {} events from {} threads in {} ({})",
        recording.event_count,
        recording.thread_count(),
        format_duration_ms(recording.duration_ms),
        recording.stop_reason
    );
    eprintln!("  {} distinct syscalls", recording.syscalls().len());
    let would_deny = recording.would_deny();
    if !would_deny.is_empty() {
        eprintln!(
            "  {YELLOW}!{RESET} outside the reference profile: {}",
            join_names(&would_deny)
        );
    }
    if let Some(failure) = &recording.scenario_failure {
        eprintln!("  {YELLOW}!{RESET} scenario failed: {failure}");
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: TraceArgs,
    }

    fn parse(argv: &[&str]) -> TraceArgs {
        Wrapper::try_parse_from(std::iter::once("swd").chain(argv.iter().copied()))
            .unwrap()
            .args
    }

    #[test]
    fn trailing_command_is_spawned() {
        let args = parse(&["--", "/usr/bin/python3", "app.py"]);
        assert_eq!(
            args.target().unwrap(),
            TraceTarget::Spawn {
                program: PathBuf::from("/usr/bin/python3"),
                args: vec!["app.py".into()],
                env: Vec::new(),
            }
        );
    }

    #[test]
    fn pid_attaches() {
        assert_eq!(
            parse(&["--pid", "42"]).target().unwrap(),
            TraceTarget::Attach { pid: 42 }
        );
        assert!(parse(&[]).target().is_err());
    }

    #[test]
    fn flags_override_configured_limits() {
        let config = SyswardenConfig::default();
        let limits = parse(&["--duration", "5", "--max-events", "100"])
            .limits(&config)
            .unwrap();
        assert_eq!(limits.max_duration, Duration::from_secs(5));
        assert_eq!(limits.max_events, 100);

        let defaults = parse(&[]).limits(&config).unwrap();
        assert_eq!(defaults, TraceLimits::from(&config.trace));
        assert!(parse(&["--duration", "0"]).limits(&config).is_err());
    }
}
