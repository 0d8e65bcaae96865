//! Installation configuration handed to the synthesizer.
//!
//! The interactive prompt flow produces an `InstallationConfig`; the CLI loads
//! the same structure from a TOML file. The value is immutable for the length
//! of a synthesis run and is only validated by the topology resolver.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::services::ServiceKind;

/// Where the main application runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InstallPlacement {
    /// Application runs directly on the host
    Local,
    /// Application runs inside the generated compose stack
    #[default]
    Orchestrated,
}

/// Where an optional service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Placement {
    /// On this host, outside the stack
    Local,
    /// On a host the synthesizer does not manage
    Remote,
    /// Inside the generated compose stack
    #[default]
    InStack,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Local => write!(f, "local"),
            Placement::Remote => write!(f, "remote"),
            Placement::InStack => write!(f, "in-stack"),
        }
    }
}

/// One optional service as chosen by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub placement: Placement,

    /// Required for remote placement; ignored when derived
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// User-supplied credential; wins over anything found on disk
    #[serde(default, rename = "api_key", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ServiceDescriptor {
    pub fn new(kind: ServiceKind, placement: Placement) -> Self {
        Self {
            name: kind.name().to_string(),
            enabled: true,
            placement,
            url: None,
            api_key: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionMode {
    /// faster-whisper inside the application
    #[default]
    Local,
    /// An external faster-whisper compatible server
    Remote,
    /// The icad-transcribe service
    Icad,
    /// OpenAI hosted transcription
    OpenAi,
}

impl TranscriptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptionMode::Local => "local",
            TranscriptionMode::Remote => "remote",
            TranscriptionMode::Icad => "icad",
            TranscriptionMode::OpenAi => "openai",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionDevice {
    Cuda,
    Cpu,
}

impl TranscriptionDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptionDevice::Cuda => "cuda",
            TranscriptionDevice::Cpu => "cpu",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TranscriptionConfig {
    #[serde(default)]
    pub mode: TranscriptionMode,

    /// Overrides the hardware-selected whisper model
    #[serde(default)]
    pub whisper_model: Option<String>,

    /// Overrides the hardware-selected device
    #[serde(default)]
    pub device: Option<TranscriptionDevice>,

    /// faster-whisper server for `remote` mode
    #[serde(default)]
    pub remote_url: Option<String>,

    #[serde(default)]
    pub openai_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    #[default]
    OpenAi,
    Ollama,
}

impl AiProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiProvider::OpenAi => "openai",
            AiProvider::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub provider: AiProvider,

    #[serde(default)]
    pub openai_api_key: Option<String>,

    #[serde(default = "default_openai_model")]
    pub openai_model: String,

    /// Overrides the hardware-selected ollama model
    #[serde(default)]
    pub ollama_model: Option<String>,
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: AiProvider::default(),
            openai_api_key: None,
            openai_model: default_openai_model(),
            ollama_model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GeocodingProvider {
    Google,
    LocationIq,
    #[default]
    Nominatim,
}

impl GeocodingProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeocodingProvider::Google => "google",
            GeocodingProvider::LocationIq => "locationiq",
            GeocodingProvider::Nominatim => "nominatim",
        }
    }

    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            GeocodingProvider::Google => Some("GOOGLE_MAPS_API_KEY"),
            GeocodingProvider::LocationIq => Some("LOCATIONIQ_API_KEY"),
            GeocodingProvider::Nominatim => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeocodingConfig {
    #[serde(default)]
    pub provider: GeocodingProvider,

    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_webserver_port")]
    pub webserver_port: u16,

    /// Port the call-upload API listens on
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_public_domain")]
    pub public_domain: String,

    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_webserver_port() -> u16 {
    3001
}

fn default_api_port() -> u16 {
    3306
}

fn default_public_domain() -> String {
    "localhost".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            webserver_port: default_webserver_port(),
            api_port: default_api_port(),
            public_domain: default_public_domain(),
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToneDetectionConfig {
    #[serde(default)]
    pub enabled: bool,

    /// `auto`, `two_tone`, `pulsed` or `long`
    #[serde(default = "default_tone_type")]
    pub detection_type: String,
}

fn default_tone_type() -> String {
    "auto".to_string()
}

impl Default for ToneDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            detection_type: default_tone_type(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Local,
    S3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub mode: StorageMode,

    #[serde(default)]
    pub s3_endpoint: Option<String>,

    #[serde(default)]
    pub s3_bucket: Option<String>,

    #[serde(default)]
    pub s3_access_key_id: Option<String>,

    #[serde(default)]
    pub s3_secret_access_key: Option<String>,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Local,
            s3_endpoint: None,
            s3_bucket: None,
            s3_access_key_id: None,
            s3_secret_access_key: None,
            s3_region: default_s3_region(),
        }
    }
}

/// Run-time knobs for the synthesizer itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthSettings {
    /// Per-command timeout for hardware probes (clamped to 5s)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Hard bound on a single dependency install
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    /// Hard bound on a single compose command
    #[serde(default = "default_orchestration_timeout")]
    pub orchestration_timeout_secs: u64,

    /// Age after which a leftover directory lock is recovered
    #[serde(default = "default_lock_stale")]
    pub lock_stale_secs: u64,

    /// Copy files aside before patching or recreating them
    #[serde(default = "default_backups")]
    pub backups: bool,
}

/// Upper bound for any single probe command.
pub const MAX_PROBE_TIMEOUT_SECS: u64 = 5;

fn default_probe_timeout() -> u64 {
    MAX_PROBE_TIMEOUT_SECS
}

fn default_install_timeout() -> u64 {
    900
}

fn default_orchestration_timeout() -> u64 {
    600
}

fn default_lock_stale() -> u64 {
    3600
}

fn default_backups() -> bool {
    true
}

impl SynthSettings {
    pub fn probe_timeout_secs(&self) -> u64 {
        self.probe_timeout_secs.clamp(1, MAX_PROBE_TIMEOUT_SECS)
    }
}

impl Default for SynthSettings {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
            install_timeout_secs: default_install_timeout(),
            orchestration_timeout_secs: default_orchestration_timeout(),
            lock_stale_secs: default_lock_stale(),
            backups: default_backups(),
        }
    }
}

/// Fully-resolved user choices for one installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InstallationConfig {
    #[serde(default)]
    pub installation: InstallPlacement,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub transcription: TranscriptionConfig,

    #[serde(default)]
    pub ai: AiConfig,

    #[serde(default)]
    pub geocoding: GeocodingConfig,

    /// `RADIO_SOFTWARE` selector; defaults to the first enabled feeder
    #[serde(default)]
    pub radio_software: Option<String>,

    #[serde(default)]
    pub tone_detection: ToneDetectionConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,

    #[serde(default)]
    pub settings: SynthSettings,
}

impl InstallationConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn service(&self, kind: ServiceKind) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.name == kind.name())
    }

    /// Builder used by tests and by callers assembling a config in code.
    pub fn with_service(mut self, descriptor: ServiceDescriptor) -> Self {
        self.services.retain(|s| s.name != descriptor.name);
        self.services.push(descriptor);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = InstallationConfig::from_toml_str("").unwrap();
        assert_eq!(config.installation, InstallPlacement::Orchestrated);
        assert_eq!(config.network.webserver_port, 3001);
        assert_eq!(config.network.api_port, 3306);
        assert_eq!(config.settings.probe_timeout_secs, 5);
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_services_parse_from_array_of_tables() {
        let config = InstallationConfig::from_toml_str(
            r#"
installation = "local"

[network]
webserver_port = 8080
timezone = "America/Chicago"

[ai]
provider = "ollama"

[[services]]
name = "ollama"
enabled = true
placement = "remote"
url = "http://gpu-box:11434"

[[services]]
name = "trunk-recorder"
enabled = true
placement = "in-stack"
"#,
        )
        .unwrap();

        assert_eq!(config.installation, InstallPlacement::Local);
        assert_eq!(config.network.webserver_port, 8080);
        assert_eq!(config.network.api_port, 3306);
        assert_eq!(config.ai.provider, AiProvider::Ollama);
        let ollama = config.service(ServiceKind::Ollama).unwrap();
        assert_eq!(ollama.placement, Placement::Remote);
        assert_eq!(ollama.url.as_deref(), Some("http://gpu-box:11434"));
        let recorder = config.service(ServiceKind::TrunkRecorder).unwrap();
        assert_eq!(recorder.placement, Placement::InStack);
    }

    #[test]
    fn test_probe_timeout_is_clamped() {
        let settings = SynthSettings {
            probe_timeout_secs: 30,
            ..SynthSettings::default()
        };
        assert_eq!(settings.probe_timeout_secs(), 5);
    }

    #[test]
    fn test_with_service_replaces_existing_entry() {
        let config = InstallationConfig::default()
            .with_service(ServiceDescriptor::new(ServiceKind::Ollama, Placement::InStack))
            .with_service(
                ServiceDescriptor::new(ServiceKind::Ollama, Placement::Remote)
                    .with_url("http://10.0.0.5:11434"),
            );
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].placement, Placement::Remote);
    }
}
