//! CLI command definitions and dispatch.

pub mod assemble;
pub mod diff;
pub mod launch;
pub mod merge;
pub mod minimize;
pub mod synthesize;
pub mod trace;
pub mod verify;
pub mod violations;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use syswarden_common::config::SyswardenConfig;
use syswarden_common::constants;
use syswarden_trace::scenario::{CommandScenario, HttpScenario, IdleScenario, ScenarioDriver};

/// syswarden — least-privilege syscall and filesystem policies from observed behavior.
#[derive(Parser, Debug)]
#[command(name = "swd", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file.
    #[arg(long, global = true, env = "SYSWARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Trace a service and record the syscalls it makes.
    Trace(trace::TraceArgs),
    /// Merge usage sets, recordings and violation hints.
    Merge(merge::MergeArgs),
    /// Build a filter profile from a usage set.
    Synthesize(synthesize::SynthesizeArgs),
    /// Compare two filter profiles.
    Diff(diff::DiffArgs),
    /// Assemble a policy bundle.
    Assemble(assemble::AssembleArgs),
    /// Verify a policy bundle's checksum.
    Verify(verify::VerifyArgs),
    /// Launch a program confined by a policy bundle.
    Launch(launch::LaunchArgs),
    /// Remove syscalls the workload does not need.
    Minimize(minimize::MinimizeArgs),
    /// List recorded policy violations.
    Violations(violations::ViolationsArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command
/// fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Trace(args) => trace::execute(args, &config),
        Command::Merge(args) => merge::execute(args, &config),
        Command::Synthesize(args) => synthesize::execute(args, &config),
        Command::Diff(args) => diff::execute(args),
        Command::Assemble(args) => assemble::execute(args, &config),
        Command::Verify(args) => verify::execute(args),
        Command::Launch(args) => launch::execute(args, &config),
        Command::Minimize(args) => minimize::execute(args, &config),
        Command::Violations(args) => violations::execute(args, &config),
    }
}

/// Loads the configuration, falling back to defaults when the default file
/// is absent. An explicitly named file must exist.
fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<SyswardenConfig> {
    let config = match path {
        Some(p) => SyswardenConfig::load(p),
        None => SyswardenConfig::load_or_default(&constants::default_config_file()),
    };
    config.map_err(|e| anyhow::anyhow!("{e}"))
}

/// Application roots from the command line, or the configured ones.
fn app_roots(cli: &[PathBuf], config: &SyswardenConfig) -> anyhow::Result<Vec<PathBuf>> {
    let roots = if cli.is_empty() {
        config.app_roots.clone()
    } else {
        cli.to_vec()
    };
    if roots.is_empty() {
        anyhow::bail!(
            "No application roots given.\n\
             Pass --app-root <DIR> or set app_roots in the configuration file."
        );
    }
    if let Some(relative) = roots.iter().find(|r| !r.is_absolute()) {
        anyhow::bail!("Application root must be absolute: {}", relative.display());
    }
    Ok(roots)
}

/// Kind of workload driven against the target.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioKind {
    /// No workload.
    None,
    /// Let the target settle without sending it work.
    Idle,
    /// Send the default web-service requests, or a request script.
    Http,
    /// Run an external driver command.
    Command,
}

/// Workload options shared by `trace` and `minimize`.
#[derive(Args, Debug)]
pub struct ScenarioArgs {
    /// Workload driven against the target.
    #[arg(long, value_enum, default_value_t = ScenarioKind::Idle)]
    pub scenario: ScenarioKind,

    /// Seconds an idle scenario waits.
    #[arg(long, default_value_t = 2)]
    pub settle: u64,

    /// Base URL of the service for the HTTP scenario.
    #[arg(long)]
    pub base_url: Option<String>,

    /// JSON request script for the HTTP scenario.
    #[arg(long)]
    pub scenario_file: Option<PathBuf>,

    /// Driver command line for the command scenario.
    #[arg(long)]
    pub driver: Option<String>,
}

impl ScenarioArgs {
    /// Builds the selected scenario driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the scenario is missing required options or its
    /// request script cannot be loaded.
    pub fn driver(&self) -> anyhow::Result<Option<Arc<dyn ScenarioDriver>>> {
        let driver: Arc<dyn ScenarioDriver> = match self.scenario {
            ScenarioKind::None => return Ok(None),
            ScenarioKind::Idle => Arc::new(IdleScenario::new(Duration::from_secs(self.settle))),
            ScenarioKind::Http => match (&self.scenario_file, &self.base_url) {
                (Some(file), _) => {
                    Arc::new(HttpScenario::load(file).map_err(|e| anyhow::anyhow!("{e}"))?)
                }
                (None, Some(url)) => Arc::new(HttpScenario::web_service(url.clone())),
                (None, None) => {
                    anyhow::bail!("The http scenario needs --base-url or --scenario-file")
                }
            },
            ScenarioKind::Command => {
                let line = self.driver.as_deref().unwrap_or_default();
                let mut words = line.split_whitespace().map(str::to_owned);
                let Some(program) = words.next() else {
                    anyhow::bail!("The command scenario needs --driver \"<program> [args]\"");
                };
                Arc::new(CommandScenario::new(program, words.collect()))
            }
        };
        Ok(Some(driver))
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn scenario(args: &[&str]) -> ScenarioArgs {
        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            scenario: ScenarioArgs,
        }
        Wrapper::try_parse_from(std::iter::once("swd").chain(args.iter().copied()))
            .unwrap()
            .scenario
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn idle_is_the_default_scenario() {
        let driver = scenario(&[]).driver().unwrap().unwrap();
        assert_eq!(driver.name(), "idle");
    }

    #[test]
    fn http_scenario_needs_a_target() {
        assert!(scenario(&["--scenario", "http"]).driver().is_err());
        let driver = scenario(&["--scenario", "http", "--base-url", "http://127.0.0.1:5000"])
            .driver()
            .unwrap()
            .unwrap();
        assert_eq!(driver.name(), "http");
    }

    #[test]
    fn command_scenario_splits_the_driver_line() {
        assert!(scenario(&["--scenario", "command"]).driver().is_err());
        let driver = scenario(&["--scenario", "command", "--driver", "curl -s localhost"])
            .driver()
            .unwrap();
        assert!(driver.is_some());
        assert!(scenario(&["--scenario", "none"]).driver().unwrap().is_none());
    }

    #[test]
    fn app_roots_prefer_the_command_line() {
        let config = SyswardenConfig {
            app_roots: vec![PathBuf::from("/srv/app")],
            ..SyswardenConfig::default()
        };
        assert_eq!(app_roots(&[], &config).unwrap(), config.app_roots);
        let cli = vec![PathBuf::from("/opt/web")];
        assert_eq!(app_roots(&cli, &config).unwrap(), cli);
        assert!(app_roots(&[], &SyswardenConfig::default()).is_err());
        assert!(app_roots(&[PathBuf::from("rel")], &config).is_err());
    }
}
