//! scanstackctl - command line front-end for the scanstack synthesizer.
//!
//! Loads an installation config, turns it into the scanner-map stack's
//! artifacts and optionally brings the stack up.

mod commands;
mod output;
mod prompt;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit code after Ctrl-C, as shells report it
const INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "scanstackctl")]
#[command(about = "Generate and start a scanner-map installation", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Installation config (TOML)
    #[arg(long, short, env = "SCANSTACK_CONFIG", default_value = "scanstack.toml", global = true)]
    config: PathBuf,

    /// Directory the artifacts are written to
    #[arg(long, default_value = ".", global = true)]
    project_dir: PathBuf,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging (unless SCANSTACK_LOG says otherwise)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate, install dependencies, probe, write artifacts and start
    Synthesize {
        /// Install missing tools without asking
        #[arg(long, short)]
        yes: bool,

        /// Write artifacts but do not start the stack
        #[arg(long)]
        no_start: bool,

        /// Do not check or install host tools
        #[arg(long)]
        skip_deps: bool,
    },

    /// Check the config and show the resolved topology
    Validate,

    /// Show detected hardware and the defaults it implies
    Probe,

    /// Check and install the host tools the config needs
    Deps {
        /// Install missing tools without asking
        #[arg(long, short)]
        yes: bool,
    },

    /// Start the generated stack
    Up,

    /// Stop the generated stack
    Down,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = std::env::var("SCANSTACK_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Dropping the command future kills any running child process and
    // releases the project lock
    let result = tokio::select! {
        result = commands::run(&cli) => result,
        _ = tokio::signal::ctrl_c() => {
            output::interrupted();
            return ExitCode::from(INTERRUPTED);
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::error(&e);
            ExitCode::from(commands::exit_code(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "scanstackctl",
            "synthesize",
            "--yes",
            "--no-start",
            "--config",
            "/tmp/site.toml",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/site.toml"));
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Synthesize {
                yes: true,
                no_start: true,
                skip_deps: false
            }
        ));
    }
}
