//! LEET - Leverage EDR for Execution of Things.
//!
//! Builds one backend per requested credentials profile and hands them to
//! the engine, then drops into the interactive terminal.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use leet_backend::cb::CbBackend;
use leet_coordinator::Leet;
use leet_logging::LogConfig;
use leet_protocol::{Backend, LeetConfig};
use tracing::error;

mod credentials;
mod terminal;

#[derive(Parser, Debug)]
#[command(name = "leet", about = "Leverage EDR for Execution of Things")]
struct Cli {
    /// Enable debug messages.
    #[arg(short, long)]
    verbose: bool,

    /// Backend profiles to connect to, comma separated. `all` expands to
    /// every profile in the credentials file.
    #[arg(long, value_delimiter = ',', default_value = "default")]
    profiles: Vec<String>,

    /// Fail a job whose hostname resolves on more than one backend instead
    /// of picking the most-recent check-in.
    #[arg(long)]
    no_conflict_resolution: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = leet_logging::init_logging(LogConfig {
        app_name: "leet",
        verbose: cli.verbose,
    }) {
        eprintln!("logging setup failed: {err:#}");
        return ExitCode::FAILURE;
    }

    let mut config = LeetConfig::from_env();
    config.solve_conflicts = !cli.no_conflict_resolution;

    let backends = match build_backends(&cli.profiles, config.max_sessions) {
        Ok(backends) => backends,
        Err(err) => {
            error!("{err:#}");
            return ExitCode::FAILURE;
        }
    };
    if backends.is_empty() {
        error!("no backends could be found for usage");
        return ExitCode::FAILURE;
    }

    let leet = match Leet::start(backends, config) {
        Ok(leet) => leet,
        Err(err) => {
            error!("{err:#}");
            return ExitCode::FAILURE;
        }
    };

    let mut terminal = terminal::Terminal::new(leet);
    if let Err(err) = terminal.run() {
        error!("terminal failed: {err:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn build_backends(profiles: &[String], max_sessions: usize) -> Result<Vec<Box<dyn Backend>>> {
    Ok(credentials::expand(profiles)?
        .into_iter()
        .map(|profile| {
            Box::new(CbBackend::new(profile.into_cb_profile(max_sessions))) as Box<dyn Backend>
        })
        .collect())
}
