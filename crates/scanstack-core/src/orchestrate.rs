//! Orchestration runner: bring the generated compose stack up.
//!
//! The whole stack is tried first. A port conflict narrows the run to the
//! services that are not running yet, one at a time. A missing image defers
//! the affected service and retries everything else. Every service ends up
//! in exactly one bucket of the returned `RunOutcome`.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

use crate::artifact::manifest::MANIFEST_FILE;
use crate::config::SynthSettings;
use crate::error::{Result, SynthError};
use crate::host::{CommandOutput, CommandSpec, HostCapability};
use crate::services::{ServiceKind, APP_SERVICE};

const PORT_CONFLICT_SIGNALS: &[&str] = &[
    "port is already allocated",
    "address already in use",
    "is already in use by container",
];

const MISSING_IMAGE_PATTERNS: &[&str] = &[
    r"pull access denied for ([^\s,]+)",
    r"No such image: ([^\s,]+)",
    r"manifest for ([^\s,]+) not found",
    r#"unable to prepare context: path "([^"]+)" not found"#,
];

fn missing_image_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        MISSING_IMAGE_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// Which compose command line is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposeFrontend {
    /// `docker compose`
    Plugin,
    /// `docker-compose`
    Legacy,
}

impl ComposeFrontend {
    fn program(&self) -> &'static str {
        match self {
            ComposeFrontend::Plugin => "docker",
            ComposeFrontend::Legacy => "docker-compose",
        }
    }

    fn prefix(&self) -> &'static [&'static str] {
        match self {
            ComposeFrontend::Plugin => &["compose"],
            ComposeFrontend::Legacy => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceFailure {
    pub service: String,
    pub reason: String,
}

/// A service left for the user to finish by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeferredService {
    pub service: String,
    pub reason: String,
    /// Command that completes the step once the image exists
    pub manual_step: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub started: Vec<String>,
    pub already_running: Vec<String>,
    pub failed: Vec<ServiceFailure>,
    pub deferred: Vec<DeferredService>,
    /// Command lines tried, in order
    pub attempts: Vec<String>,
}

impl RunOutcome {
    /// Whether some desired service did not come up.
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty() || !self.deferred.is_empty()
    }

    /// One line per service that did not start.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings: Vec<String> = self
            .failed
            .iter()
            .map(|f| format!("{} did not start: {}", f.service, f.reason))
            .collect();
        warnings.extend(self.deferred.iter().map(|d| {
            format!(
                "{} deferred ({}); run `{}` once it is available",
                d.service, d.reason, d.manual_step
            )
        }));
        warnings
    }
}

/// Whether compose output reports a host port or container name clash.
pub fn is_port_conflict(output: &str) -> bool {
    let lower = output.to_lowercase();
    PORT_CONFLICT_SIGNALS.iter().any(|s| lower.contains(s))
}

/// Image references or build contexts that compose reported as missing.
pub fn missing_image_refs(output: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for pattern in missing_image_patterns() {
        for caps in pattern.captures_iter(output) {
            if let Some(m) = caps.get(1) {
                let r = m.as_str().trim_end_matches(['.', ':', ';']).to_string();
                if !refs.contains(&r) {
                    refs.push(r);
                }
            }
        }
    }
    refs
}

fn repository(image: &str) -> &str {
    let image = image.rsplit('/').next().unwrap_or(image);
    image.split(':').next().unwrap_or(image)
}

/// Whether a missing reference points at `service`'s image or build context.
fn reference_matches(service: ServiceKind, reference: &str) -> bool {
    let Some(source) = service.image() else {
        return false;
    };
    if repository(source.image()) == repository(reference) {
        return true;
    }
    if let crate::services::ImageSource::Build { context, .. } = source {
        let dir = context.trim_start_matches("./");
        let reference = reference.trim_end_matches('/');
        return reference == context || reference.rsplit(['/', '\\']).next() == Some(dir);
    }
    false
}

/// Services among `pending` whose image compose could not find.
fn services_missing_image(output: &str, pending: &[String]) -> Vec<(String, String)> {
    let refs = missing_image_refs(output);
    pending
        .iter()
        .filter_map(|name| {
            let kind = ServiceKind::from_name(name)?;
            refs.iter()
                .find(|r| reference_matches(kind, r))
                .map(|r| (name.clone(), r.clone()))
        })
        .collect()
}

/// Dependencies before the application; the app depends on everything else.
fn dependencies_first(services: &mut [String]) {
    services.sort_by_key(|s| s == APP_SERVICE);
}

/// Drives `docker compose` for one project directory.
pub struct ComposeRunner<'a, H: ?Sized> {
    host: &'a H,
    project_dir: PathBuf,
    timeout: Duration,
}

impl<'a, H: HostCapability + ?Sized> ComposeRunner<'a, H> {
    pub fn new(host: &'a H, project_dir: &Path, settings: &SynthSettings) -> Self {
        Self {
            host,
            project_dir: project_dir.to_path_buf(),
            timeout: Duration::from_secs(settings.orchestration_timeout_secs),
        }
    }

    /// Prefer the compose plugin, fall back to the standalone binary.
    pub async fn detect_frontend(&self) -> Result<ComposeFrontend> {
        for frontend in [ComposeFrontend::Plugin, ComposeFrontend::Legacy] {
            let mut args: Vec<&str> = frontend.prefix().to_vec();
            args.push("version");
            let spec = CommandSpec::new(frontend.program(), args);
            if self.host.run(&spec).await.success() {
                info!(frontend = ?frontend, "Using compose front-end");
                return Ok(frontend);
            }
        }
        Err(SynthError::Orchestration(
            "neither `docker compose` nor `docker-compose` is available".to_string(),
        ))
    }

    fn command(&self, frontend: ComposeFrontend, args: &[&str]) -> CommandSpec {
        let manifest = self.project_dir.join(MANIFEST_FILE);
        let dir = self.project_dir.display().to_string();
        let mut full: Vec<String> = frontend.prefix().iter().map(|s| s.to_string()).collect();
        full.extend([
            "-f".to_string(),
            manifest.display().to_string(),
            "--project-directory".to_string(),
            dir,
        ]);
        full.extend(args.iter().map(|s| s.to_string()));
        CommandSpec::new(frontend.program(), full)
            .timeout(self.timeout)
            .streaming()
            .cwd(&self.project_dir)
    }

    async fn compose(
        &self,
        frontend: ComposeFrontend,
        args: &[&str],
        outcome: &mut RunOutcome,
    ) -> CommandOutput {
        let spec = self.command(frontend, args);
        outcome.attempts.push(spec.display());
        let out = self.host.run(&spec).await;
        if out.success() {
            info!(command = %spec.display(), duration_ms = out.duration_ms, "Compose command succeeded");
        } else {
            warn!(command = %spec.display(), reason = %out.failure_reason(), "Compose command failed");
        }
        out
    }

    /// Names of services compose reports as running.
    pub async fn running_services(&self, frontend: ComposeFrontend) -> Vec<String> {
        let spec = self.command(frontend, &["ps", "--services", "--filter", "status=running"]);
        let out = self.host.run(&spec).await;
        if !out.success() {
            return Vec::new();
        }
        out.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Start `services` (manifest order), narrowing scope on known failures.
    pub async fn up(&self, services: &[String]) -> Result<RunOutcome> {
        let frontend = self.detect_frontend().await?;
        let mut outcome = RunOutcome::default();
        let mut diagnostics = Vec::new();
        let mut pending: Vec<String> = services.to_vec();
        let mut whole_stack = true;

        while !pending.is_empty() {
            let mut args = vec!["up", "-d"];
            if !whole_stack {
                // A deferred service may still be a depends_on target
                args.push("--no-deps");
                args.extend(pending.iter().map(String::as_str));
            }
            let out = self.compose(frontend, &args, &mut outcome).await;
            if out.success() {
                outcome.started.append(&mut pending);
                break;
            }
            let text = out.combined();
            diagnostics.push(format!("$ {}\n{}", out.command, text));

            let missing = services_missing_image(&text, &pending);
            if !missing.is_empty() {
                for (service, reference) in missing {
                    warn!(service = %service, image = %reference, "Image not available, deferring");
                    pending.retain(|s| *s != service);
                    outcome.deferred.push(self.deferral(frontend, &service, &reference));
                }
                dependencies_first(&mut pending);
                whole_stack = false;
                continue;
            }

            if is_port_conflict(&text) {
                warn!("Port conflict reported, starting services individually");
                self.start_individually(frontend, &pending, &mut outcome, &mut diagnostics)
                    .await;
                pending.clear();
                break;
            }

            let reason = out.failure_reason();
            outcome.failed.extend(pending.drain(..).map(|service| ServiceFailure {
                service,
                reason: reason.clone(),
            }));
        }

        if outcome.started.is_empty() && outcome.already_running.is_empty() {
            return Err(SynthError::Fatal {
                message: "no service of the stack could be started".to_string(),
                diagnostics: diagnostics.join("\n\n"),
            });
        }

        if outcome.is_partial() {
            warn!(
                started = ?outcome.started,
                failed = outcome.failed.len(),
                deferred = outcome.deferred.len(),
                "Stack partially started"
            );
        } else {
            info!(started = ?outcome.started, "Stack started");
        }
        Ok(outcome)
    }

    async fn start_individually(
        &self,
        frontend: ComposeFrontend,
        pending: &[String],
        outcome: &mut RunOutcome,
        diagnostics: &mut Vec<String>,
    ) {
        let running: BTreeSet<String> = self.running_services(frontend).await.into_iter().collect();

        let mut order = pending.to_vec();
        dependencies_first(&mut order);

        for service in &order {
            if running.contains(service) {
                outcome.already_running.push(service.clone());
                continue;
            }
            let out = self
                .compose(frontend, &["up", "-d", "--no-deps", service.as_str()], outcome)
                .await;
            if out.success() {
                outcome.started.push(service.clone());
                continue;
            }
            let text = out.combined();
            diagnostics.push(format!("$ {}\n{}", out.command, text));
            match services_missing_image(&text, std::slice::from_ref(service)).pop() {
                Some((_, reference)) => {
                    outcome.deferred.push(self.deferral(frontend, service, &reference))
                }
                None => outcome.failed.push(ServiceFailure {
                    service: service.clone(),
                    reason: out.failure_reason(),
                }),
            }
        }
    }

    fn deferral(&self, frontend: ComposeFrontend, service: &str, reference: &str) -> DeferredService {
        let build = ServiceKind::from_name(service)
            .and_then(|k| k.image())
            .is_some_and(|i| i.requires_build());
        let verb = if build { "build" } else { "pull" };
        let mut step: Vec<&str> = vec![frontend.program()];
        step.extend(frontend.prefix());
        DeferredService {
            service: service.to_string(),
            reason: format!("image {} not found", reference),
            manual_step: format!("{0} {1} {2} && {0} up -d {2}", step.join(" "), verb, service),
        }
    }

    /// Stop and remove the stack's containers.
    pub async fn down(&self) -> Result<Vec<String>> {
        let frontend = self.detect_frontend().await?;
        let mut outcome = RunOutcome::default();
        let out = self.compose(frontend, &["down"], &mut outcome).await;
        if !out.success() {
            return Err(SynthError::Orchestration(out.failure_reason()));
        }
        Ok(outcome.attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_conflict_signals() {
        assert!(is_port_conflict(
            "Error response from daemon: driver failed programming external connectivity: Bind for 0.0.0.0:3001 failed: port is already allocated"
        ));
        assert!(is_port_conflict("listen tcp 0.0.0.0:11434: bind: address already in use"));
        assert!(!is_port_conflict("pull access denied for op25"));
    }

    #[test]
    fn test_missing_image_refs_map_to_services() {
        let output = "Error response from daemon: pull access denied for op25, repository does not exist\n\
                      unable to prepare context: path \"/srv/scanner/icad-transcribe\" not found";
        let pending = vec![
            "scanner-map".to_string(),
            "op25".to_string(),
            "icad-transcribe".to_string(),
            "ollama".to_string(),
        ];
        let missing: Vec<String> = services_missing_image(output, &pending)
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(missing, vec!["op25", "icad-transcribe"]);
    }

    #[test]
    fn test_application_is_ordered_last() {
        let mut services = vec![
            "scanner-map".to_string(),
            "ollama".to_string(),
            "trunk-recorder".to_string(),
        ];
        dependencies_first(&mut services);
        assert_eq!(services, vec!["ollama", "trunk-recorder", "scanner-map"]);
    }

    #[test]
    fn test_repository_ignores_registry_and_tag() {
        assert_eq!(repository("docker.io/ollama/ollama:latest"), "ollama");
        assert_eq!(repository("op25:local"), "op25");
    }
}
