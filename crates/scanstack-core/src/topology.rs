//! Topology resolution: validate an `InstallationConfig` and derive the
//! cross-service URLs every generator works from.
//!
//! Validation collects every issue before failing so the caller can show the
//! whole list at once. Nothing on disk is touched before this step succeeds.

use std::collections::BTreeSet;
use tracing::{debug, info};
use url::Url;

use crate::config::{
    AiProvider, InstallPlacement, InstallationConfig, Placement, StorageMode, TranscriptionMode,
};
use crate::error::{Result, SynthError, ValidationIssue};
use crate::services::{ServiceKind, APP_SERVICE, UPLOAD_PATH};

/// Host the application is reachable at from containers when it runs on the host.
pub const HOST_GATEWAY: &str = "host.docker.internal";

/// One enabled optional service after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub kind: ServiceKind,
    /// Effective placement (a conflicting remote URL turns in-stack into remote)
    pub placement: Placement,
    /// URL the application uses to reach the service
    pub url: String,
    /// Where a feeder sends its calls
    pub upload_url: Option<String>,
    /// Credential supplied by the user, if any
    pub api_key: Option<String>,
}

impl ResolvedService {
    pub fn is_in_stack(&self) -> bool {
        self.placement == Placement::InStack
    }
}

/// Validated view of the topology. Downstream generators trust it.
#[derive(Debug, Clone)]
pub struct ResolvedTopology {
    pub installation: InstallPlacement,
    /// Enabled services, catalog order
    pub services: Vec<ResolvedService>,
    /// `RADIO_SOFTWARE` value
    pub radio_software: Option<ServiceKind>,
    /// Non-fatal adjustments made during resolution
    pub notes: Vec<String>,
}

impl ResolvedTopology {
    pub fn service(&self, kind: ServiceKind) -> Option<&ResolvedService> {
        self.services.iter().find(|s| s.kind == kind)
    }

    pub fn in_stack(&self) -> impl Iterator<Item = &ResolvedService> {
        self.services.iter().filter(|s| s.is_in_stack())
    }

    pub fn app_in_stack(&self) -> bool {
        self.installation == InstallPlacement::Orchestrated
    }

    /// Whether any compose manifest is needed at all.
    pub fn needs_manifest(&self) -> bool {
        self.app_in_stack() || self.in_stack().next().is_some()
    }

    /// Services the manifest should contain, app first.
    pub fn manifest_services(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.app_in_stack() {
            names.push(APP_SERVICE.to_string());
        }
        names.extend(self.in_stack().map(|s| s.kind.name().to_string()));
        names
    }
}

/// Validate the config and derive the resolved topology.
pub fn resolve(config: &InstallationConfig) -> Result<ResolvedTopology> {
    let mut issues = Vec::new();
    let mut notes = Vec::new();

    validate_network(config, &mut issues);

    let mut seen = BTreeSet::new();
    let mut resolved = Vec::new();

    for (idx, desc) in config.services.iter().enumerate() {
        let field = format!("services[{}]", idx);
        let Some(kind) = ServiceKind::from_name(&desc.name) else {
            issues.push(ValidationIssue::new(
                format!("{}.name", field),
                format!("unknown service '{}'", desc.name),
            ));
            continue;
        };
        if !seen.insert(kind) {
            issues.push(ValidationIssue::new(
                format!("{}.name", field),
                format!("service '{}' is listed more than once", kind),
            ));
            continue;
        }
        if !desc.enabled {
            debug!(service = %kind, "disabled, skipping");
            continue;
        }

        let field = format!("services.{}", kind);
        let user_url = desc.url.as_deref().map(str::trim).filter(|u| !u.is_empty());

        let parsed = match user_url {
            Some(raw) => match parse_service_url(raw) {
                Ok(url) => Some(url),
                Err(msg) => {
                    issues.push(ValidationIssue::new(format!("{}.url", field), msg));
                    continue;
                }
            },
            None => None,
        };

        let given = user_url.zip(parsed.as_ref());
        let (placement, url) = match (desc.placement, given) {
            (Placement::Remote | Placement::Local, None) => {
                issues.push(ValidationIssue::new(
                    format!("{}.url", field),
                    format!(
                        "a {} service needs the URL it is reachable at",
                        desc.placement
                    ),
                ));
                continue;
            }
            (Placement::Remote, Some((raw, url))) => {
                if config.installation == InstallPlacement::Orchestrated
                    && url.host_str() == Some(kind.name())
                {
                    issues.push(ValidationIssue::new(
                        format!("{}.url", field),
                        format!(
                            "remote URL points at the in-stack hostname '{}' but the service is not in the stack",
                            kind
                        ),
                    ));
                    continue;
                }
                (Placement::Remote, raw.to_string())
            }
            (Placement::Local, Some((raw, _))) => (Placement::Local, raw.to_string()),
            (Placement::InStack, Some((raw, url))) if !is_stack_host(url, kind) => {
                notes.push(format!(
                    "{}: URL {} points at another host; treating as remote and skipping in-stack generation",
                    kind, url
                ));
                (Placement::Remote, raw.to_string())
            }
            (Placement::InStack, _) => {
                if !kind.supports_in_stack() {
                    issues.push(ValidationIssue::new(
                        format!("{}.placement", field),
                        format!("{} is desktop software and cannot run in the stack", kind),
                    ));
                    continue;
                }
                let host = match config.installation {
                    InstallPlacement::Orchestrated => kind.name(),
                    InstallPlacement::Local => "localhost",
                };
                (Placement::InStack, kind.endpoint().url_for_host(host))
            }
        };

        let upload_url = kind
            .feeder_kind()
            .map(|_| upload_url_for(config, placement));

        resolved.push(ResolvedService {
            kind,
            placement,
            url,
            upload_url,
            api_key: desc
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
        });
    }

    resolved.sort_by_key(|s| s.kind);

    validate_providers(config, &resolved, &mut issues);
    validate_published_ports(config, &resolved, &mut issues);
    let radio_software = resolve_radio_software(config, &resolved, &mut issues);

    if !issues.is_empty() {
        return Err(SynthError::Validation(issues));
    }

    info!(
        installation = ?config.installation,
        enabled = resolved.len(),
        in_stack = resolved.iter().filter(|s| s.is_in_stack()).count(),
        "Topology resolved"
    );

    Ok(ResolvedTopology {
        installation: config.installation,
        services: resolved,
        radio_software,
        notes,
    })
}

fn parse_service_url(raw: &str) -> std::result::Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("'{}' is not a valid URL: {}", raw, e))?;
    if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
        return Err(format!("unsupported URL scheme '{}'", url.scheme()));
    }
    if url.host_str().is_none() {
        return Err(format!("'{}' has no host", raw));
    }
    Ok(url)
}

/// A URL given alongside `in-stack` is consistent only if it names the stack itself.
fn is_stack_host(url: &Url, kind: ServiceKind) -> bool {
    matches!(
        url.host_str(),
        Some(host) if host == kind.name() || host == "localhost" || host == "127.0.0.1"
    )
}

fn upload_url_for(config: &InstallationConfig, placement: Placement) -> String {
    let port = config.network.api_port;
    let host = match (placement, config.installation) {
        (Placement::InStack, InstallPlacement::Orchestrated) => APP_SERVICE,
        (Placement::InStack, InstallPlacement::Local) => HOST_GATEWAY,
        (Placement::Local, _) => "localhost",
        (Placement::Remote, _) => config.network.public_domain.as_str(),
    };
    format!("http://{}:{}/{}", host, port, UPLOAD_PATH)
}

fn validate_network(config: &InstallationConfig, issues: &mut Vec<ValidationIssue>) {
    let net = &config.network;
    if net.webserver_port == 0 {
        issues.push(ValidationIssue::new("network.webserver_port", "port must be non-zero"));
    }
    if net.api_port == 0 {
        issues.push(ValidationIssue::new("network.api_port", "port must be non-zero"));
    }
    if net.webserver_port != 0 && net.webserver_port == net.api_port {
        issues.push(ValidationIssue::new(
            "network.api_port",
            format!("collides with webserver_port {}", net.webserver_port),
        ));
    }
    if net.public_domain.trim().is_empty() {
        issues.push(ValidationIssue::new("network.public_domain", "must not be empty"));
    }
    if net.timezone.trim().is_empty() {
        issues.push(ValidationIssue::new("network.timezone", "must not be empty"));
    }
    if config.storage.mode == StorageMode::S3 && config.storage.s3_bucket.is_none() {
        issues.push(ValidationIssue::new(
            "storage.s3_bucket",
            "required when storage mode is s3",
        ));
    }
}

fn validate_providers(
    config: &InstallationConfig,
    resolved: &[ResolvedService],
    issues: &mut Vec<ValidationIssue>,
) {
    let enabled = |kind| resolved.iter().any(|s| s.kind == kind);

    match config.transcription.mode {
        TranscriptionMode::Icad if !enabled(ServiceKind::IcadTranscribe) => {
            issues.push(ValidationIssue::new(
                "transcription.mode",
                "icad mode requires the icad-transcribe service to be enabled",
            ));
        }
        TranscriptionMode::Remote => match config.transcription.remote_url.as_deref() {
            None => issues.push(ValidationIssue::new(
                "transcription.remote_url",
                "required for remote transcription",
            )),
            Some(raw) => {
                if let Err(msg) = parse_service_url(raw.trim()) {
                    issues.push(ValidationIssue::new("transcription.remote_url", msg));
                }
            }
        },
        _ => {}
    }

    if config.ai.provider == AiProvider::Ollama && !enabled(ServiceKind::Ollama) {
        issues.push(ValidationIssue::new(
            "ai.provider",
            "ollama provider requires the ollama service to be enabled",
        ));
    }
}

/// In-stack services publish their fixed ports on the host; they must not
/// collide with each other or with the application ports.
fn validate_published_ports(
    config: &InstallationConfig,
    resolved: &[ResolvedService],
    issues: &mut Vec<ValidationIssue>,
) {
    let mut taken: Vec<(u16, String)> = vec![
        (config.network.webserver_port, "network.webserver_port".to_string()),
        (config.network.api_port, "network.api_port".to_string()),
    ];
    for service in resolved.iter().filter(|s| s.is_in_stack()) {
        let port = service.kind.endpoint().port;
        if let Some((_, owner)) = taken.iter().find(|(p, _)| *p == port) {
            issues.push(ValidationIssue::new(
                format!("services.{}", service.kind),
                format!("published port {} is already used by {}", port, owner),
            ));
        } else {
            taken.push((port, format!("services.{}", service.kind)));
        }
    }
}

fn resolve_radio_software(
    config: &InstallationConfig,
    resolved: &[ResolvedService],
    issues: &mut Vec<ValidationIssue>,
) -> Option<ServiceKind> {
    let first_feeder = || {
        resolved
            .iter()
            .find(|s| s.kind.feeder_kind().is_some())
            .map(|s| s.kind)
    };

    match config.radio_software.as_deref().map(str::trim) {
        None | Some("") => first_feeder(),
        Some("none") => None,
        Some(name) => match ServiceKind::from_name(name) {
            Some(kind) if kind.feeder_kind().is_none() => {
                issues.push(ValidationIssue::new(
                    "radio_software",
                    format!("'{}' is not radio software", name),
                ));
                None
            }
            Some(kind) if !resolved.iter().any(|s| s.kind == kind) => {
                issues.push(ValidationIssue::new(
                    "radio_software",
                    format!("'{}' is selected but not enabled", name),
                ));
                None
            }
            Some(kind) => Some(kind),
            None => {
                issues.push(ValidationIssue::new(
                    "radio_software",
                    format!("unknown radio software '{}'", name),
                ));
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceDescriptor;

    fn orchestrated() -> InstallationConfig {
        InstallationConfig::default()
    }

    fn issues(err: SynthError) -> Vec<ValidationIssue> {
        match err {
            SynthError::Validation(issues) => issues,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_in_stack_url_uses_service_hostname() {
        let config = orchestrated().with_service(ServiceDescriptor::new(
            ServiceKind::IcadTranscribe,
            Placement::InStack,
        ));
        let topo = resolve(&config).unwrap();
        let icad = topo.service(ServiceKind::IcadTranscribe).unwrap();
        assert_eq!(icad.url, "http://icad-transcribe:9912/api/transcribe");
        assert!(icad.is_in_stack());
    }

    #[test]
    fn test_local_installation_uses_localhost() {
        let mut config = orchestrated().with_service(ServiceDescriptor::new(
            ServiceKind::Ollama,
            Placement::InStack,
        ));
        config.installation = InstallPlacement::Local;
        let topo = resolve(&config).unwrap();
        assert_eq!(
            topo.service(ServiceKind::Ollama).unwrap().url,
            "http://localhost:11434"
        );
        assert!(!topo.app_in_stack());
        assert!(topo.needs_manifest());
    }

    #[test]
    fn test_remote_without_url_fails() {
        let config = orchestrated()
            .with_service(ServiceDescriptor::new(ServiceKind::Ollama, Placement::Remote));
        let issues = issues(resolve(&config).unwrap_err());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "services.ollama.url");
    }

    #[test]
    fn test_local_without_url_fails() {
        let config = orchestrated()
            .with_service(ServiceDescriptor::new(ServiceKind::Ollama, Placement::Local));
        let issues = issues(resolve(&config).unwrap_err());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "services.ollama.url");
        assert!(issues[0].message.contains("local"));
    }

    #[test]
    fn test_local_service_keeps_given_url() {
        let config = orchestrated().with_service(
            ServiceDescriptor::new(ServiceKind::Ollama, Placement::Local)
                .with_url("http://127.0.0.1:11434"),
        );
        let topo = resolve(&config).unwrap();
        let ollama = topo.service(ServiceKind::Ollama).unwrap();
        assert_eq!(ollama.placement, Placement::Local);
        assert_eq!(ollama.url, "http://127.0.0.1:11434");
    }

    #[test]
    fn test_conflicting_url_wins_over_in_stack() {
        let config = orchestrated().with_service(
            ServiceDescriptor::new(ServiceKind::Ollama, Placement::InStack)
                .with_url("http://gpu-box.lan:11434"),
        );
        let topo = resolve(&config).unwrap();
        let ollama = topo.service(ServiceKind::Ollama).unwrap();
        assert_eq!(ollama.placement, Placement::Remote);
        assert_eq!(ollama.url, "http://gpu-box.lan:11434");
        assert_eq!(topo.notes.len(), 1);
        assert!(topo.in_stack().next().is_none());
    }

    #[test]
    fn test_in_stack_url_naming_the_stack_is_consistent() {
        let config = orchestrated().with_service(
            ServiceDescriptor::new(ServiceKind::Ollama, Placement::InStack)
                .with_url("http://ollama:11434"),
        );
        let topo = resolve(&config).unwrap();
        assert!(topo.service(ServiceKind::Ollama).unwrap().is_in_stack());
        assert!(topo.notes.is_empty());
    }

    #[test]
    fn test_remote_url_naming_in_stack_host_is_contradiction() {
        let config = orchestrated().with_service(
            ServiceDescriptor::new(ServiceKind::Ollama, Placement::Remote)
                .with_url("http://ollama:11434"),
        );
        assert!(resolve(&config).is_err());
    }

    #[test]
    fn test_feeder_upload_urls_follow_placement() {
        let config = orchestrated()
            .with_service(ServiceDescriptor::new(ServiceKind::TrunkRecorder, Placement::InStack))
            .with_service(
                ServiceDescriptor::new(ServiceKind::Sdrtrunk, Placement::Local)
                    .with_url("http://localhost:8100/stream"),
            );
        let topo = resolve(&config).unwrap();
        assert_eq!(
            topo.service(ServiceKind::TrunkRecorder).unwrap().upload_url.as_deref(),
            Some("http://scanner-map:3306/api/call-upload")
        );
        assert_eq!(
            topo.service(ServiceKind::Sdrtrunk).unwrap().upload_url.as_deref(),
            Some("http://localhost:3306/api/call-upload")
        );
        assert_eq!(topo.radio_software, Some(ServiceKind::TrunkRecorder));
    }

    #[test]
    fn test_in_stack_feeder_under_local_install_uses_host_gateway() {
        let mut config = orchestrated()
            .with_service(ServiceDescriptor::new(ServiceKind::RdioScanner, Placement::InStack));
        config.installation = InstallPlacement::Local;
        let topo = resolve(&config).unwrap();
        assert_eq!(
            topo.service(ServiceKind::RdioScanner).unwrap().upload_url.as_deref(),
            Some("http://host.docker.internal:3306/api/call-upload")
        );
    }

    #[test]
    fn test_desktop_software_rejected_in_stack() {
        let config = orchestrated()
            .with_service(ServiceDescriptor::new(ServiceKind::Sdrtrunk, Placement::InStack));
        let issues = issues(resolve(&config).unwrap_err());
        assert_eq!(issues[0].field, "services.sdrtrunk.placement");
    }

    #[test]
    fn test_provider_requires_enabled_service() {
        let mut config = orchestrated();
        config.ai.provider = AiProvider::Ollama;
        config.transcription.mode = TranscriptionMode::Icad;
        let issues = issues(resolve(&config).unwrap_err());
        let fields: Vec<_> = issues.iter().map(|i| i.field.as_str()).collect();
        assert!(fields.contains(&"ai.provider"));
        assert!(fields.contains(&"transcription.mode"));
    }

    #[test]
    fn test_unknown_and_duplicate_services_reported_together() {
        let mut config = orchestrated();
        config.services = vec![
            ServiceDescriptor::new(ServiceKind::Ollama, Placement::InStack),
            ServiceDescriptor::new(ServiceKind::Ollama, Placement::InStack),
            ServiceDescriptor {
                name: "pager-gateway".to_string(),
                enabled: true,
                placement: Placement::InStack,
                url: None,
                api_key: None,
            },
        ];
        let issues = issues(resolve(&config).unwrap_err());
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn test_published_port_collision_detected() {
        let mut config = orchestrated()
            .with_service(ServiceDescriptor::new(ServiceKind::RdioScanner, Placement::InStack));
        config.network.webserver_port = 3000;
        let issues = issues(resolve(&config).unwrap_err());
        assert_eq!(issues[0].field, "services.rdio-scanner");
    }

    #[test]
    fn test_radio_software_must_be_enabled_feeder() {
        let mut config = orchestrated();
        config.radio_software = Some("op25".to_string());
        assert!(resolve(&config).is_err());

        config.radio_software = Some("none".to_string());
        let topo = resolve(&config).unwrap();
        assert_eq!(topo.radio_software, None);
    }

    #[test]
    fn test_disabled_services_are_dropped() {
        let mut desc = ServiceDescriptor::new(ServiceKind::Ollama, Placement::Remote);
        desc.enabled = false;
        let topo = resolve(&orchestrated().with_service(desc)).unwrap();
        assert!(topo.services.is_empty());
        assert_eq!(topo.manifest_services(), vec![APP_SERVICE.to_string()]);
    }
}
