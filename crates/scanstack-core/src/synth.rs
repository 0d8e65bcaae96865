//! The synthesis pipeline.
//!
//! resolve -> lock -> dependencies -> hardware -> defaults -> credentials ->
//! artifacts -> optional start. Validation happens before anything on disk is
//! touched; every later step either completes or leaves the previous files in
//! place.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::artifact::doc::YamlDoc;
use crate::artifact::envfile::{env_fields, read_env_value, EnvDoc, ENV_FILE};
use crate::artifact::manifest::{manifest_fields, read_manifest_api_key, MANIFEST_FILE};
use crate::artifact::native::{read_native_api_key, reconcile_native};
use crate::artifact::{ArtifactKind, ArtifactOutcome, ArtifactWriter};
use crate::config::{InstallationConfig, Placement};
use crate::defaults::{select_defaults, EffectiveDefaults};
use crate::deps::{required_dependencies, DependencyInstaller, DependencyReport, Prompter};
use crate::error::Result;
use crate::hardware::{probe_hardware, HardwareProfile};
use crate::host::HostCapability;
use crate::journal::Journal;
use crate::lock::SynthLock;
use crate::orchestrate::{ComposeRunner, RunOutcome};
use crate::secrets::{CredentialChoice, CredentialSource, ExistingValue, SecretManager};
use crate::topology::{resolve, ResolvedTopology};

#[derive(Debug, Clone)]
pub struct SynthOptions {
    pub project_dir: PathBuf,
    /// Skip the dependency installer entirely
    pub skip_deps: bool,
    /// Bring the stack up after writing artifacts
    pub start: bool,
}

impl SynthOptions {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            skip_deps: false,
            start: true,
        }
    }
}

/// Result of writing the artifact set.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSet {
    pub artifacts: Vec<ArtifactOutcome>,
    pub credentials: Vec<CredentialChoice>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisReport {
    pub project_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<DependencyReport>,
    pub hardware: HardwareProfile,
    pub defaults: EffectiveDefaults,
    pub credentials: Vec<CredentialChoice>,
    pub artifacts: Vec<ArtifactOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunOutcome>,
    /// Everything that went wrong without failing the run
    pub warnings: Vec<String>,
}

/// Previous credential values for `kind`, in reuse priority order.
fn existing_credentials(project_dir: &Path, kind: crate::services::ServiceKind) -> Vec<ExistingValue> {
    let mut found = Vec::new();
    if let Some(value) = kind
        .credential_env_key()
        .and_then(|key| read_env_value(project_dir, key))
    {
        found.push(ExistingValue::new(CredentialSource::EnvFile, value));
    }
    if let Some(value) = read_native_api_key(project_dir, kind) {
        found.push(ExistingValue::new(CredentialSource::NativeConfig, value));
    }
    if let Some(value) = read_manifest_api_key(project_dir, kind) {
        found.push(ExistingValue::new(CredentialSource::Manifest, value));
    }
    found
}

/// Decide one credential per service before any artifact is written.
fn issue_credentials(
    project_dir: &Path,
    topology: &ResolvedTopology,
    secrets: &mut SecretManager,
    warnings: &mut Vec<String>,
) {
    for service in topology.services.iter().filter(|s| s.kind.needs_credential()) {
        let existing = existing_credentials(project_dir, service.kind);
        let user = service.api_key.as_deref();
        if service.placement == Placement::Remote {
            // Remote services own their key; a generated one would never match
            if secrets.reuse_only(service.kind, user, &existing).is_none() {
                warnings.push(format!(
                    "{}: no credential known for the remote service; set services.{}.api_key",
                    service.kind, service.kind
                ));
            }
        } else {
            secrets.get_or_create(service.kind, user, &existing);
        }
    }
}

/// Reconcile every artifact for the resolved topology.
pub fn generate_artifacts(
    config: &InstallationConfig,
    topology: &ResolvedTopology,
    defaults: &EffectiveDefaults,
    project_dir: &Path,
) -> Result<ArtifactSet> {
    let writer = ArtifactWriter::new(project_dir, config.settings.backups);
    let mut warnings = Vec::new();

    let mut secrets = SecretManager::new();
    issue_credentials(project_dir, topology, &mut secrets, &mut warnings);
    warnings.extend(secrets.take_warnings());
    let credentials = secrets.credentials();

    let mut artifacts = Vec::new();

    if topology.needs_manifest() {
        let fields = manifest_fields(config, topology, defaults, &credentials);
        artifacts.push(writer.reconcile::<YamlDoc>(
            Path::new(MANIFEST_FILE),
            ArtifactKind::Manifest,
            &fields,
        )?);
    }

    let fields = env_fields(config, topology, defaults, &credentials);
    artifacts.push(writer.reconcile::<EnvDoc>(Path::new(ENV_FILE), ArtifactKind::Env, &fields)?);

    for service in &topology.services {
        if let Some(outcome) =
            reconcile_native(&writer, service, defaults, credentials.get(&service.kind))?
        {
            artifacts.push(outcome);
        }
    }

    warnings.extend(artifacts.iter().filter_map(ArtifactOutcome::warning));
    let written = artifacts.iter().filter(|a| a.action.wrote()).count();
    info!(artifacts = artifacts.len(), written, "Artifacts reconciled");

    Ok(ArtifactSet {
        artifacts,
        credentials: secrets.choices(),
        warnings,
    })
}

/// Run the whole pipeline against `options.project_dir`.
pub async fn synthesize<H, P>(
    config: &InstallationConfig,
    host: &H,
    prompter: &P,
    options: &SynthOptions,
) -> Result<SynthesisReport>
where
    H: HostCapability + ?Sized,
    P: Prompter + ?Sized,
{
    let project_dir = options.project_dir.as_path();
    let settings = &config.settings;

    let topology = resolve(config)?;
    let mut warnings = topology.notes.clone();

    let mut lock = SynthLock::acquire(project_dir, "dependencies", settings.lock_stale_secs)?;
    warnings.extend(lock.take_warning());

    let dependencies = if options.skip_deps {
        info!("Skipping dependency checks");
        None
    } else {
        let required = required_dependencies(config, &topology);
        let report = DependencyInstaller::new(host, prompter, settings)
            .with_journal(Journal::for_project(project_dir))
            .ensure(&required)
            .await;
        report.require_all()?;
        Some(report)
    };

    set_step(&mut lock, "hardware");
    let hardware = probe_hardware(host, Duration::from_secs(settings.probe_timeout_secs())).await;
    let defaults = select_defaults(config, &hardware);

    set_step(&mut lock, "artifacts");
    let set = generate_artifacts(config, &topology, &defaults, project_dir)?;
    warnings.extend(set.warnings);

    let run = if options.start && topology.needs_manifest() {
        set_step(&mut lock, "orchestration");
        let runner = ComposeRunner::new(host, project_dir, settings);
        let outcome = runner.up(&topology.manifest_services()).await?;
        warnings.extend(outcome.warnings());
        Some(outcome)
    } else {
        None
    };

    for warning in &warnings {
        warn!("{}", warning);
    }
    info!(warnings = warnings.len(), "Synthesis finished");

    Ok(SynthesisReport {
        project_dir: project_dir.to_path_buf(),
        dependencies,
        hardware,
        defaults,
        credentials: set.credentials,
        artifacts: set.artifacts,
        run,
        warnings,
    })
}

fn set_step(lock: &mut SynthLock, step: &str) {
    if let Err(e) = lock.update_step(step) {
        warn!(step = step, error = %e, "Could not record step in lock file");
    }
}
