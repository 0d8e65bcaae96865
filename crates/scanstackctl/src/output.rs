//! Terminal output - plain ASCII, colored where it helps.

use anyhow::Result;
use owo_colors::OwoColorize;
use serde::Serialize;

use scanstack_core::artifact::ArtifactAction;
use scanstack_core::defaults::EffectiveDefaults;
use scanstack_core::deps::{DependencyReport, DependencyState};
use scanstack_core::hardware::HardwareProfile;
use scanstack_core::orchestrate::RunOutcome;
use scanstack_core::synth::SynthesisReport;
use scanstack_core::ResolvedTopology;

const SEPARATOR: &str = "------------------------------------------------------------";

pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn section(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", SEPARATOR.dimmed());
}

pub fn success(message: &str) {
    println!("{} {}", "[OK]".bright_green(), message);
}

fn warning(message: &str) {
    println!("{} {}", "[WARN]".yellow(), message);
}

pub fn error(err: &anyhow::Error) {
    eprintln!();
    eprintln!("{} {}", "[ERROR]".bright_red(), err.to_string().red());
    for cause in err.chain().skip(1) {
        eprintln!("        caused by: {}", cause);
    }
    if let Some(scanstack_core::SynthError::Fatal { diagnostics, .. }) =
        err.downcast_ref::<scanstack_core::SynthError>()
    {
        if !diagnostics.is_empty() {
            eprintln!();
            eprintln!("{}", "Tool output:".dimmed());
            for line in diagnostics.lines() {
                eprintln!("  {}", line);
            }
        }
    }
    eprintln!();
}

pub fn interrupted() {
    eprintln!();
    eprintln!("{} Interrupted; the project lock has been released", "[STOP]".yellow());
}

pub fn print_topology(topology: &ResolvedTopology) {
    section("Topology");
    println!("  application: {:?}", topology.installation);
    for service in &topology.services {
        let upload = service
            .upload_url
            .as_deref()
            .map(|u| format!("  upload {}", u))
            .unwrap_or_default();
        println!(
            "  {:<16} {:<10} {}{}",
            service.kind.name(),
            service.placement.to_string().cyan(),
            service.url,
            upload.dimmed()
        );
    }
    let stack = topology.manifest_services();
    if stack.is_empty() {
        println!("  no compose stack needed");
    } else {
        println!("  stack: {}", stack.join(", "));
    }
    for note in &topology.notes {
        warning(note);
    }
}

pub fn print_hardware(hardware: &HardwareProfile, defaults: &EffectiveDefaults) {
    section("Hardware");
    match hardware.gpu() {
        Some(gpu) => println!("  gpu:     {:?} {}", gpu.vendor, gpu.model),
        None => println!(
            "  gpu:     none ({})",
            hardware.gpu.reason().unwrap_or("not detected").dimmed()
        ),
    }
    if hardware.sdr_devices().is_empty() {
        println!(
            "  sdr:     none ({})",
            hardware.sdr.reason().unwrap_or("no devices found").dimmed()
        );
    }
    for device in hardware.sdr_devices() {
        println!("  sdr:     {} ({})", device.device_string, device.description);
    }
    if let (Some(ram), Some(cores)) = (hardware.ram_gb, hardware.cpu_cores) {
        println!("  memory:  {} GB, {} cores", ram, cores);
    }

    section("Defaults");
    println!(
        "  transcription: {} / {} / {}",
        defaults.device.as_str(),
        defaults.compute_type,
        defaults.whisper_model
    );
    println!("  ollama model:  {}", defaults.ollama_model);
    println!(
        "  gpu reserved:  {}",
        if defaults.gpu_reservation { "yes" } else { "no" }
    );
    for source in &defaults.sources {
        println!("  source:        {}", source.device_string);
    }
}

pub fn print_dependencies(report: &DependencyReport) {
    section("Host tools");
    for outcome in &report.outcomes {
        let state = outcome.state();
        let label = match state {
            DependencyState::Satisfied | DependencyState::Installed => {
                state.as_str().bright_green().to_string()
            }
            _ => state.as_str().bright_red().to_string(),
        };
        let detail = outcome
            .version
            .as_deref()
            .or(outcome.detail.as_deref())
            .unwrap_or("");
        println!("  {:<16} {:<14} {}", outcome.dependency.name(), label, detail.dimmed());
    }
}

pub fn print_run(outcome: &RunOutcome) {
    print_run_states(outcome);
    for line in outcome.warnings() {
        warning(&line);
    }
}

fn print_run_states(outcome: &RunOutcome) {
    section("Stack");
    for service in &outcome.started {
        println!("  {:<16} {}", service, "started".bright_green());
    }
    for service in &outcome.already_running {
        println!("  {:<16} {}", service, "running".green());
    }
    for failure in &outcome.failed {
        println!("  {:<16} {}", failure.service, "failed".bright_red());
    }
    for deferred in &outcome.deferred {
        println!("  {:<16} {}", deferred.service, "deferred".yellow());
    }
}

pub fn print_report(report: &SynthesisReport) {
    if let Some(deps) = &report.dependencies {
        print_dependencies(deps);
    }
    print_hardware(&report.hardware, &report.defaults);

    section("Artifacts");
    for outcome in &report.artifacts {
        let action = match &outcome.action {
            ArtifactAction::Unchanged => outcome.action.to_string().dimmed().to_string(),
            ArtifactAction::Recreated { .. } => outcome.action.to_string().yellow().to_string(),
            _ => outcome.action.to_string().bright_green().to_string(),
        };
        println!("  {:<40} {}", outcome.artifact.path.display(), action);
        if let Some(backup) = &outcome.backup {
            println!("  {:<40} {}", "", format!("backup {}", backup.display()).dimmed());
        }
    }

    section("Credentials");
    for choice in &report.credentials {
        println!("  {:<16} {}", choice.service.name(), choice.source);
    }

    match &report.run {
        // Run warnings are already part of the report's warnings
        Some(run) => print_run_states(run),
        None => {
            println!();
            println!("  stack not started");
        }
    }

    if !report.warnings.is_empty() {
        section("Warnings");
        for line in &report.warnings {
            warning(line);
        }
    }
    println!();
    success(&format!("Project written to {}", report.project_dir.display()));
}
