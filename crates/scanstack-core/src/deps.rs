//! Dependency installer.
//!
//! Each required host tool walks `missing -> prompt -> installing ->
//! {installed | still-missing}`. A tool that is already present is only
//! checked, never reinstalled. Every install attempt is logged and appended
//! to the install journal, and the report lists exactly what is still missing
//! so the caller can decide whether to abort.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{InstallPlacement, InstallationConfig, SynthSettings, TranscriptionMode};
use crate::error::{Result, SynthError};
use crate::host::{CommandSpec, HostCapability, InstallMethod};
use crate::journal::{InstallLogEntry, Journal};
use crate::topology::ResolvedTopology;

/// Host tools the generated stack may need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dependency {
    Docker,
    Compose,
    Node,
    Python,
    Git,
}

impl Dependency {
    pub fn name(&self) -> &'static str {
        match self {
            Dependency::Docker => "docker",
            Dependency::Compose => "docker compose",
            Dependency::Node => "node",
            Dependency::Python => "python",
            Dependency::Git => "git",
        }
    }

    /// Commands that prove the tool is present. Any one succeeding is enough.
    pub fn check_commands(&self) -> Vec<CommandSpec> {
        match self {
            Dependency::Docker => vec![CommandSpec::new("docker", ["--version"])],
            Dependency::Compose => vec![
                CommandSpec::new("docker", ["compose", "version"]),
                CommandSpec::new("docker-compose", ["--version"]),
            ],
            Dependency::Node => vec![CommandSpec::new("node", ["--version"])],
            Dependency::Python => vec![
                CommandSpec::new("python3", ["--version"]),
                CommandSpec::new("python", ["--version"]),
            ],
            Dependency::Git => vec![CommandSpec::new("git", ["--version"])],
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// States of the per-dependency install machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyState {
    /// Present before anything was attempted
    Satisfied,
    Missing,
    Prompt,
    Installing,
    Installed,
    StillMissing,
}

impl DependencyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyState::Satisfied => "satisfied",
            DependencyState::Missing => "missing",
            DependencyState::Prompt => "prompt",
            DependencyState::Installing => "installing",
            DependencyState::Installed => "installed",
            DependencyState::StillMissing => "still_missing",
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, DependencyState::Satisfied | DependencyState::Installed)
    }
}

/// How one dependency ended up.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyOutcome {
    pub dependency: Dependency,
    /// Every state visited, in order
    pub transitions: Vec<DependencyState>,
    pub version: Option<String>,
    pub method: Option<String>,
    pub detail: Option<String>,
}

impl DependencyOutcome {
    pub fn state(&self) -> DependencyState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(DependencyState::Missing)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyReport {
    pub outcomes: Vec<DependencyOutcome>,
}

impl DependencyReport {
    pub fn missing(&self) -> Vec<Dependency> {
        self.outcomes
            .iter()
            .filter(|o| !o.state().is_present())
            .map(|o| o.dependency)
            .collect()
    }

    pub fn installed(&self) -> Vec<Dependency> {
        self.outcomes
            .iter()
            .filter(|o| o.state() == DependencyState::Installed)
            .map(|o| o.dependency)
            .collect()
    }

    /// Fail with the list of remaining gaps, if any.
    pub fn require_all(&self) -> Result<()> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SynthError::HostDependency {
                missing: missing.iter().map(|d| d.name().to_string()).collect(),
            })
        }
    }
}

/// Asks the user before anything is installed.
pub trait Prompter {
    fn confirm(&self, question: &str) -> bool;
}

/// Says yes to everything (`--yes`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

impl Prompter for AutoConfirm {
    fn confirm(&self, question: &str) -> bool {
        info!("Auto-confirmed: {}", question);
        true
    }
}

/// Says no to everything; used for non-interactive checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deny;

impl Prompter for Deny {
    fn confirm(&self, _question: &str) -> bool {
        false
    }
}

/// Tools needed for the resolved topology.
pub fn required_dependencies(
    config: &InstallationConfig,
    topology: &ResolvedTopology,
) -> Vec<Dependency> {
    let in_stack_builds = topology
        .in_stack()
        .any(|s| s.kind.image().map(|i| i.requires_build()).unwrap_or(false));

    let mut deps = Vec::new();
    match config.installation {
        InstallPlacement::Orchestrated => {
            deps.push(Dependency::Docker);
            deps.push(Dependency::Compose);
        }
        InstallPlacement::Local => {
            if topology.needs_manifest() {
                deps.push(Dependency::Docker);
                deps.push(Dependency::Compose);
            }
            deps.push(Dependency::Node);
            if config.transcription.mode == TranscriptionMode::Local {
                deps.push(Dependency::Python);
            }
        }
    }
    if in_stack_builds {
        deps.push(Dependency::Git);
    }
    deps
}

/// Version line of the tool, or `None` when it is absent.
pub async fn check_dependency<H: HostCapability + ?Sized>(
    host: &H,
    dependency: Dependency,
    timeout: Duration,
) -> Option<String> {
    for command in dependency.check_commands() {
        let output = host.run(&command.timeout(timeout)).await;
        if output.success() {
            let version = output
                .combined()
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("")
                .to_string();
            return Some(version);
        }
    }
    None
}

/// Walks the install state machine for every required dependency.
pub struct DependencyInstaller<'a, H: ?Sized, P: ?Sized> {
    host: &'a H,
    prompter: &'a P,
    check_timeout: Duration,
    install_timeout: Duration,
    journal: Option<Journal>,
}

impl<'a, H, P> DependencyInstaller<'a, H, P>
where
    H: HostCapability + ?Sized,
    P: Prompter + ?Sized,
{
    pub fn new(host: &'a H, prompter: &'a P, settings: &SynthSettings) -> Self {
        Self {
            host,
            prompter,
            check_timeout: Duration::from_secs(settings.probe_timeout_secs()),
            install_timeout: Duration::from_secs(settings.install_timeout_secs),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Dependencies are handled one at a time, in order; installing docker
    /// first can satisfy compose on its own. An install method is offered at
    /// most once per run, so a bundle such as Docker Desktop is never
    /// prompted for twice.
    pub async fn ensure(&self, required: &[Dependency]) -> DependencyReport {
        let mut report = DependencyReport::default();
        let mut offered: Vec<(InstallMethod, Dependency)> = Vec::new();
        for dependency in required {
            let outcome = self.ensure_one(*dependency, &mut offered).await;
            info!(
                dependency = %dependency,
                state = outcome.state().as_str(),
                "Dependency checked"
            );
            report.outcomes.push(outcome);
        }
        report
    }

    async fn ensure_one(
        &self,
        dependency: Dependency,
        offered: &mut Vec<(InstallMethod, Dependency)>,
    ) -> DependencyOutcome {
        if let Some(version) = check_dependency(self.host, dependency, self.check_timeout).await {
            return DependencyOutcome {
                dependency,
                transitions: vec![DependencyState::Satisfied],
                version: Some(version),
                method: None,
                detail: None,
            };
        }

        let method = self.host.platform().install_method(dependency);
        let mut outcome = DependencyOutcome {
            dependency,
            transitions: vec![DependencyState::Missing],
            version: None,
            method: Some(method.describe()),
            detail: None,
        };

        if let InstallMethod::Unsupported { reason } = &method {
            warn!(dependency = %dependency, reason = %reason, "No install method");
            outcome.detail = Some(reason.clone());
            outcome.transitions.push(DependencyState::StillMissing);
            self.record(&outcome).await;
            return outcome;
        }

        if let Some((_, first)) = offered.iter().find(|(m, _)| *m == method) {
            info!(dependency = %dependency, shared_with = %first, "Install already offered");
            outcome.detail = Some(format!("not provided by the {} install", first));
            outcome.transitions.push(DependencyState::StillMissing);
            self.record(&outcome).await;
            return outcome;
        }
        offered.push((method.clone(), dependency));

        outcome.transitions.push(DependencyState::Prompt);
        let question = format!(
            "{} is required but not installed. Install it now ({})?",
            dependency,
            method.describe()
        );
        if !self.prompter.confirm(&question) {
            outcome.detail = Some("declined by user".to_string());
            outcome.transitions.push(DependencyState::StillMissing);
            self.record(&outcome).await;
            return outcome;
        }

        outcome.transitions.push(DependencyState::Installing);
        let attempt = self.attempt_install(dependency, &method).await;

        match check_dependency(self.host, dependency, self.check_timeout).await {
            Some(version) => {
                outcome.version = Some(version);
                outcome.transitions.push(DependencyState::Installed);
                outcome.detail = attempt.err();
            }
            None => {
                outcome.detail = Some(
                    attempt
                        .err()
                        .unwrap_or_else(|| "not found after install".to_string()),
                );
                outcome.transitions.push(DependencyState::StillMissing);
            }
        }
        self.record(&outcome).await;
        outcome
    }

    /// Run the install method. `Err` carries the failure detail.
    async fn attempt_install(
        &self,
        dependency: Dependency,
        method: &InstallMethod,
    ) -> std::result::Result<(), String> {
        match method {
            InstallMethod::Package { command, .. } => {
                info!(dependency = %dependency, command = %command.display(), "Installing");
                let output = self
                    .host
                    .run(&command.clone().timeout(self.install_timeout))
                    .await;
                if output.success() {
                    Ok(())
                } else {
                    warn!(dependency = %dependency, reason = %output.failure_reason(), "Install failed");
                    Err(output.failure_reason())
                }
            }
            InstallMethod::DownloadPage { url } => {
                let open = self.host.platform().open_url(url);
                let output = self.host.run(&open.timeout(self.check_timeout)).await;
                if !output.success() {
                    warn!(url = %url, "Could not open the download page");
                }
                let done = self.prompter.confirm(&format!(
                    "Install {} from {} and confirm when finished.",
                    dependency, url
                ));
                if done {
                    Ok(())
                } else {
                    Err("manual install not confirmed".to_string())
                }
            }
            InstallMethod::Unsupported { reason } => Err(reason.clone()),
        }
    }

    async fn record(&self, outcome: &DependencyOutcome) {
        let Some(journal) = &self.journal else {
            return;
        };
        let entry = InstallLogEntry::new(
            outcome.dependency.name(),
            outcome.method.clone().unwrap_or_default(),
            outcome.state().as_str(),
            outcome.detail.clone().unwrap_or_default(),
        );
        if let Err(e) = journal.append(&entry).await {
            warn!(error = %e, "Failed to write install journal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Placement, ServiceDescriptor};
    use crate::services::ServiceKind;
    use crate::topology::resolve;

    #[test]
    fn test_orchestrated_needs_docker_and_compose() {
        let config = InstallationConfig::default();
        let topo = resolve(&config).unwrap();
        assert_eq!(
            required_dependencies(&config, &topo),
            vec![Dependency::Docker, Dependency::Compose]
        );
    }

    #[test]
    fn test_local_install_with_build_service() {
        let mut config = InstallationConfig::default()
            .with_service(ServiceDescriptor::new(ServiceKind::Op25, Placement::InStack));
        config.installation = InstallPlacement::Local;
        let topo = resolve(&config).unwrap();
        assert_eq!(
            required_dependencies(&config, &topo),
            vec![
                Dependency::Docker,
                Dependency::Compose,
                Dependency::Node,
                Dependency::Python,
                Dependency::Git
            ]
        );
    }

    #[test]
    fn test_report_lists_remaining_gaps() {
        let report = DependencyReport {
            outcomes: vec![
                DependencyOutcome {
                    dependency: Dependency::Docker,
                    transitions: vec![DependencyState::Satisfied],
                    version: Some("Docker version 27.0.3".to_string()),
                    method: None,
                    detail: None,
                },
                DependencyOutcome {
                    dependency: Dependency::Compose,
                    transitions: vec![
                        DependencyState::Missing,
                        DependencyState::Prompt,
                        DependencyState::StillMissing,
                    ],
                    version: None,
                    method: None,
                    detail: Some("declined by user".to_string()),
                },
            ],
        };
        assert_eq!(report.missing(), vec![Dependency::Compose]);
        match report.require_all() {
            Err(SynthError::HostDependency { missing }) => {
                assert_eq!(missing, vec!["docker compose".to_string()])
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
