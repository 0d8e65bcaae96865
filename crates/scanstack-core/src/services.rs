//! Catalog of the services a scanner-map stack can contain.
//!
//! Every optional service has a fixed endpoint (scheme, port, path), an image
//! source for the orchestration manifest, and, for radio feeders, the native
//! config file the synthesizer maintains for it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the mandatory application service in the manifest.
pub const APP_SERVICE: &str = "scanner-map";

/// Path of the call-upload endpoint on the application API port.
pub const UPLOAD_PATH: &str = "api/call-upload";

/// Compose network every generated service joins.
pub const STACK_NETWORK: &str = "scanstack";

/// Optional services known to the synthesizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Ollama,
    IcadTranscribe,
    TrunkRecorder,
    Sdrtrunk,
    RdioScanner,
    Op25,
}

/// What a service does for the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    /// Local LLM used as the AI provider
    AiProvider,
    /// Remote transcription engine
    Transcription,
    /// Radio software that uploads calls to the application
    Feeder(FeederKind),
}

/// The native-config family of a feeder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederKind {
    Recorder,
    StreamClient,
    WebScanner,
    Decoder,
}

/// Where the manifest gets a service's image from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Pulled from a registry
    Pull(&'static str),
    /// Built from a local directory that may not exist yet
    Build {
        context: &'static str,
        image: &'static str,
    },
}

impl ImageSource {
    pub fn image(&self) -> &'static str {
        match self {
            ImageSource::Pull(image) => image,
            ImageSource::Build { image, .. } => image,
        }
    }

    pub fn requires_build(&self) -> bool {
        matches!(self, ImageSource::Build { .. })
    }
}

/// Fixed network location of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: &'static str,
    pub port: u16,
    pub path: &'static str,
}

impl Endpoint {
    /// `scheme://host:port[/path]`
    pub fn url_for_host(&self, host: &str) -> String {
        if self.path.is_empty() {
            format!("{}://{}:{}", self.scheme, host, self.port)
        } else {
            format!("{}://{}:{}/{}", self.scheme, host, self.port, self.path)
        }
    }
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 6] = [
        ServiceKind::Ollama,
        ServiceKind::IcadTranscribe,
        ServiceKind::TrunkRecorder,
        ServiceKind::Sdrtrunk,
        ServiceKind::RdioScanner,
        ServiceKind::Op25,
    ];

    /// Service name, used as manifest key and intra-stack hostname.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Ollama => "ollama",
            ServiceKind::IcadTranscribe => "icad-transcribe",
            ServiceKind::TrunkRecorder => "trunk-recorder",
            ServiceKind::Sdrtrunk => "sdrtrunk",
            ServiceKind::RdioScanner => "rdio-scanner",
            ServiceKind::Op25 => "op25",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn role(&self) -> ServiceRole {
        match self {
            ServiceKind::Ollama => ServiceRole::AiProvider,
            ServiceKind::IcadTranscribe => ServiceRole::Transcription,
            ServiceKind::TrunkRecorder => ServiceRole::Feeder(FeederKind::Recorder),
            ServiceKind::Sdrtrunk => ServiceRole::Feeder(FeederKind::StreamClient),
            ServiceKind::RdioScanner => ServiceRole::Feeder(FeederKind::WebScanner),
            ServiceKind::Op25 => ServiceRole::Feeder(FeederKind::Decoder),
        }
    }

    pub fn feeder_kind(&self) -> Option<FeederKind> {
        match self.role() {
            ServiceRole::Feeder(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        let (port, path) = match self {
            ServiceKind::Ollama => (11434, ""),
            ServiceKind::IcadTranscribe => (9912, "api/transcribe"),
            ServiceKind::TrunkRecorder => (3005, ""),
            ServiceKind::Sdrtrunk => (8100, "stream"),
            ServiceKind::RdioScanner => (3000, ""),
            ServiceKind::Op25 => (8080, ""),
        };
        Endpoint {
            scheme: "http",
            port,
            path,
        }
    }

    /// Image source, or `None` for desktop software that cannot run in-stack.
    pub fn image(&self) -> Option<ImageSource> {
        match self {
            ServiceKind::Ollama => Some(ImageSource::Pull("ollama/ollama:latest")),
            ServiceKind::IcadTranscribe => Some(ImageSource::Build {
                context: "./icad-transcribe",
                image: "icad-transcribe:local",
            }),
            ServiceKind::TrunkRecorder => {
                Some(ImageSource::Pull("robotastic/trunk-recorder:latest"))
            }
            ServiceKind::Sdrtrunk => None,
            ServiceKind::RdioScanner => Some(ImageSource::Pull("chuot/rdio-scanner:latest")),
            ServiceKind::Op25 => Some(ImageSource::Build {
                context: "./op25",
                image: "op25:local",
            }),
        }
    }

    pub fn supports_in_stack(&self) -> bool {
        self.image().is_some()
    }

    /// Whether the application authenticates this service with an API key.
    pub fn needs_credential(&self) -> bool {
        !matches!(self, ServiceKind::Ollama)
    }

    /// Environment-file key holding this service's credential.
    pub fn credential_env_key(&self) -> Option<&'static str> {
        match self {
            ServiceKind::Ollama => None,
            ServiceKind::IcadTranscribe => Some("ICAD_API_KEY"),
            ServiceKind::TrunkRecorder => Some("TRUNK_RECORDER_API_KEY"),
            ServiceKind::Sdrtrunk => Some("SDRTRUNK_API_KEY"),
            ServiceKind::RdioScanner => Some("RDIO_SCANNER_API_KEY"),
            ServiceKind::Op25 => Some("OP25_API_KEY"),
        }
    }

    /// Native config file, relative to the project directory.
    pub fn native_config_path(&self) -> Option<&'static str> {
        match self.feeder_kind()? {
            FeederKind::Recorder => Some("trunk-recorder/config.json"),
            FeederKind::StreamClient => Some("sdrtrunk/streaming.toml"),
            FeederKind::WebScanner => Some("rdio-scanner/config.yaml"),
            FeederKind::Decoder => Some("op25/uploader.toml"),
        }
    }

    /// Container path the native config is mounted at when in-stack.
    pub fn native_config_mount(&self) -> Option<&'static str> {
        match self.feeder_kind()? {
            FeederKind::Recorder => Some("/app/config.json"),
            FeederKind::StreamClient => None,
            FeederKind::WebScanner => Some("/app/config.yaml"),
            FeederKind::Decoder => Some("/op25/uploader.toml"),
        }
    }

    /// Whether the service is granted GPU access when an NVIDIA GPU exists.
    pub fn wants_gpu(&self) -> bool {
        matches!(self, ServiceKind::Ollama | ServiceKind::IcadTranscribe)
    }

    /// Whether the service needs the host's USB bus for SDR dongles.
    pub fn wants_usb(&self) -> bool {
        matches!(self, ServiceKind::TrunkRecorder | ServiceKind::Op25)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
