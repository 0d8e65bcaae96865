//! Command handlers for scanstackctl.

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

use scanstack_core::defaults::select_defaults;
use scanstack_core::deps::{required_dependencies, AutoConfirm, DependencyInstaller, Prompter};
use scanstack_core::hardware::probe_hardware;
use scanstack_core::journal::Journal;
use scanstack_core::lock::SynthLock;
use scanstack_core::orchestrate::ComposeRunner;
use scanstack_core::{
    resolve, synthesize, InstallationConfig, SynthError, SynthOptions, SystemHost,
};

use crate::output;
use crate::prompt::TerminalPrompter;
use crate::{Cli, Commands};

/// Process exit code for a failed command.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|e| e.downcast_ref::<SynthError>())
        .map(|e| e.exit_code())
        .unwrap_or(1)
        .clamp(1, 255) as u8
}

fn load_config(path: &Path) -> Result<InstallationConfig> {
    InstallationConfig::load(path)
        .with_context(|| format!("Failed to load installation config {}", path.display()))
}

fn prompter(yes: bool) -> Box<dyn Prompter> {
    if yes {
        Box::new(AutoConfirm)
    } else {
        Box::new(TerminalPrompter::default())
    }
}

pub async fn run(cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    match &cli.command {
        Commands::Synthesize {
            yes,
            no_start,
            skip_deps,
        } => handle_synthesize(cli, &config, *yes, !*no_start, *skip_deps).await,
        Commands::Validate => handle_validate(cli, &config),
        Commands::Probe => handle_probe(cli, &config).await,
        Commands::Deps { yes } => handle_deps(cli, &config, *yes).await,
        Commands::Up => handle_up(cli, &config).await,
        Commands::Down => handle_down(cli, &config).await,
    }
}

async fn handle_synthesize(
    cli: &Cli,
    config: &InstallationConfig,
    yes: bool,
    start: bool,
    skip_deps: bool,
) -> Result<()> {
    let host = SystemHost::new();
    let prompter = prompter(yes);
    let options = SynthOptions {
        project_dir: cli.project_dir.clone(),
        skip_deps,
        start,
    };
    let report = synthesize(config, &host, prompter.as_ref(), &options).await?;

    if cli.json {
        output::json(&report)
    } else {
        output::print_report(&report);
        Ok(())
    }
}

fn handle_validate(cli: &Cli, config: &InstallationConfig) -> Result<()> {
    let topology = resolve(config)?;
    if cli.json {
        let services: Vec<_> = topology
            .services
            .iter()
            .map(|s| {
                serde_json::json!({
                    "service": s.kind.name(),
                    "placement": s.placement.to_string(),
                    "url": s.url,
                    "upload_url": s.upload_url,
                })
            })
            .collect();
        output::json(&serde_json::json!({
            "installation": topology.installation,
            "services": services,
            "manifest_services": topology.manifest_services(),
            "notes": topology.notes,
        }))
    } else {
        output::print_topology(&topology);
        Ok(())
    }
}

fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.cyan} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

async fn handle_probe(cli: &Cli, config: &InstallationConfig) -> Result<()> {
    let host = SystemHost::new();
    let timeout = Duration::from_secs(config.settings.probe_timeout_secs());

    let progress = (!cli.json).then(|| spinner("Probing hardware..."));
    let hardware = probe_hardware(&host, timeout).await;
    if let Some(progress) = progress {
        progress.finish_and_clear();
    }
    let defaults = select_defaults(config, &hardware);

    if cli.json {
        output::json(&serde_json::json!({
            "hardware": hardware,
            "defaults": defaults,
        }))
    } else {
        output::print_hardware(&hardware, &defaults);
        Ok(())
    }
}

async fn handle_deps(cli: &Cli, config: &InstallationConfig, yes: bool) -> Result<()> {
    let topology = resolve(config)?;
    let host = SystemHost::new();
    let prompter = prompter(yes);
    let required = required_dependencies(config, &topology);

    let report = DependencyInstaller::new(&host, prompter.as_ref(), &config.settings)
        .with_journal(Journal::for_project(&cli.project_dir))
        .ensure(&required)
        .await;

    if cli.json {
        output::json(&report)?;
    } else {
        output::print_dependencies(&report);
    }
    report.require_all()?;
    Ok(())
}

async fn handle_up(cli: &Cli, config: &InstallationConfig) -> Result<()> {
    let topology = resolve(config)?;
    if !topology.needs_manifest() {
        bail!("Nothing to start: no service runs in the stack");
    }
    let _lock = SynthLock::acquire(
        &cli.project_dir,
        "orchestration",
        config.settings.lock_stale_secs,
    )?;
    let host = SystemHost::new();
    let runner = ComposeRunner::new(&host, &cli.project_dir, &config.settings);
    let outcome = runner.up(&topology.manifest_services()).await?;

    if cli.json {
        output::json(&outcome)
    } else {
        output::print_run(&outcome);
        Ok(())
    }
}

async fn handle_down(cli: &Cli, config: &InstallationConfig) -> Result<()> {
    let _lock = SynthLock::acquire(
        &cli.project_dir,
        "orchestration",
        config.settings.lock_stale_secs,
    )?;
    let host = SystemHost::new();
    let runner = ComposeRunner::new(&host, &cli.project_dir, &config.settings);
    let attempts = runner.down().await?;

    if cli.json {
        output::json(&serde_json::json!({ "commands": attempts }))
    } else {
        output::success("Stack stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_follows_synth_error() {
        let err = anyhow::Error::new(SynthError::Locked {
            holder: "pid 1".to_string(),
        });
        assert_eq!(exit_code(&err), 75);

        let wrapped = anyhow::Error::new(SynthError::Validation(Vec::new()))
            .context("while validating");
        assert_eq!(exit_code(&wrapped), 65);

        assert_eq!(exit_code(&anyhow::anyhow!("plain failure")), 1);
    }
}
