//! The shared `.env` file.
//!
//! `EnvDoc` keeps the file as lines so comments, blank lines, ordering and
//! keys the generator does not know about survive a patch untouched.

use serde_json::Value;
use std::path::Path;

use super::{Document, FieldPath, ManagedField, Segment};
use crate::config::{AiProvider, InstallationConfig, StorageMode, TranscriptionMode};
use crate::defaults::EffectiveDefaults;
use crate::error::{Result, SynthError};
use crate::secrets::Credentials;
use crate::services::ServiceKind;
use crate::topology::ResolvedTopology;

pub const ENV_FILE: &str = ".env";

const HEADER: &str = "# scanner-map environment\n# Keys written by scanstack are corrected on the next run; anything else is left alone.\n";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// Comment, blank or anything that is not `KEY=VALUE`; kept verbatim
    Raw(String),
    Entry { key: String, value: String, raw: String },
}

/// Line-preserving dotenv document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvDoc {
    lines: Vec<Line>,
}

impl EnvDoc {
    /// Effective value of `key` (the last assignment wins).
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|l| match l {
            Line::Entry { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn keys(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::Entry { key, .. } => Some(key.as_str()),
                Line::Raw(_) => None,
            })
            .collect()
    }

    pub fn set_value(&mut self, key: &str, value: &str) {
        let raw = format!("{}={}", key, quote(value));
        let mut found = false;
        for line in &mut self.lines {
            if let Line::Entry { key: k, value: v, raw: r } = line {
                if k == key {
                    *v = value.to_string();
                    *r = raw.clone();
                    found = true;
                }
            }
        }
        if !found {
            self.lines.push(Line::Entry {
                key: key.to_string(),
                value: value.to_string(),
                raw,
            });
        }
    }

    pub fn remove_key(&mut self, key: &str) -> bool {
        let before = self.lines.len();
        self.lines
            .retain(|l| !matches!(l, Line::Entry { key: k, .. } if k == key));
        self.lines.len() != before
    }
}

fn parse_line(raw: &str) -> Line {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Line::Raw(raw.to_string());
    }
    let body = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let Some((key, value)) = body.split_once('=') else {
        return Line::Raw(raw.to_string());
    };
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Line::Raw(raw.to_string());
    }
    Line::Entry {
        key: key.to_string(),
        value: unquote(value.trim()),
        raw: raw.to_string(),
    }
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == b'"' && last == b'"' {
            return value[1..value.len() - 1]
                .replace("\\\"", "\"")
                .replace("\\\\", "\\");
        }
        if first == b'\'' && last == b'\'' {
            return value[1..value.len() - 1].to_string();
        }
    }
    // Unquoted values may carry a trailing comment
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end().to_string(),
        None => value.to_string(),
    }
}

fn quote(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '\\' | '$' | '`'));
    if needs_quotes {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

fn single_key(path: &FieldPath) -> Result<&str> {
    match path.segments() {
        [Segment::Key(key)] => Ok(key.as_str()),
        _ => Err(SynthError::artifact(
            ENV_FILE,
            format!("'{}' is not a plain environment key", path),
        )),
    }
}

fn env_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl Document for EnvDoc {
    fn empty() -> Self {
        EnvDoc {
            lines: HEADER.lines().map(|l| Line::Raw(l.to_string())).collect(),
        }
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        Ok(EnvDoc {
            lines: text.lines().map(parse_line).collect(),
        })
    }

    fn render(&self) -> Result<String> {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Raw(raw) | Line::Entry { raw, .. } => out.push_str(raw),
            }
            out.push('\n');
        }
        Ok(out)
    }

    fn get(&self, path: &FieldPath) -> Option<Value> {
        let key = single_key(path).ok()?;
        self.value(key).map(|v| Value::String(v.to_string()))
    }

    fn set(&mut self, path: &FieldPath, value: &Value) -> Result<()> {
        let key = single_key(path)?;
        self.set_value(key, &env_text(value));
        Ok(())
    }

    fn remove(&mut self, path: &FieldPath) -> bool {
        match single_key(path) {
            Ok(key) => self.remove_key(key),
            Err(_) => false,
        }
    }
}

fn key(name: &str) -> FieldPath {
    FieldPath::keys([name])
}

/// Managed when the user supplied it, otherwise an empty slot for a fresh file.
fn user_value(fields: &mut Vec<ManagedField>, name: &str, supplied: Option<&String>) {
    match supplied.map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(value) => fields.push(ManagedField::value(key(name), value)),
        None => fields.push(ManagedField::seed(key(name), "")),
    }
}

/// Fields of the `.env` file, in the order a fresh file lists them.
pub fn env_fields(
    config: &InstallationConfig,
    topology: &ResolvedTopology,
    defaults: &EffectiveDefaults,
    credentials: &Credentials,
) -> Vec<ManagedField> {
    let mut fields = Vec::new();
    let net = &config.network;

    fields.push(ManagedField::value(key("WEBSERVER_PORT"), net.webserver_port.to_string()));
    fields.push(ManagedField::value(key("API_PORT"), net.api_port.to_string()));
    fields.push(ManagedField::value(key("PUBLIC_DOMAIN"), net.public_domain.as_str()));
    fields.push(ManagedField::value(key("TIMEZONE"), net.timezone.as_str()));

    // Transcription
    let tx = &config.transcription;
    fields.push(ManagedField::value(key("TRANSCRIPTION_MODE"), tx.mode.as_str()));
    match tx.mode {
        TranscriptionMode::Local => {
            // Hardware-picked values are seeds; explicit choices are managed
            let whisper = match &tx.whisper_model {
                Some(_) => ManagedField::value(key("WHISPER_MODEL"), defaults.whisper_model.as_str()),
                None => ManagedField::seed(key("WHISPER_MODEL"), defaults.whisper_model.as_str()),
            };
            fields.push(whisper);
            let (device, compute) = (defaults.device.as_str(), defaults.compute_type.as_str());
            if tx.device.is_some() {
                fields.push(ManagedField::value(key("TRANSCRIPTION_DEVICE"), device));
                fields.push(ManagedField::value(key("TRANSCRIPTION_COMPUTE_TYPE"), compute));
            } else {
                fields.push(ManagedField::seed(key("TRANSCRIPTION_DEVICE"), device));
                fields.push(ManagedField::seed(key("TRANSCRIPTION_COMPUTE_TYPE"), compute));
            }
        }
        TranscriptionMode::Remote => {
            if let Some(url) = &tx.remote_url {
                fields.push(ManagedField::value(key("FASTER_WHISPER_SERVER_URL"), url.trim()));
            }
        }
        TranscriptionMode::Icad => {}
        TranscriptionMode::OpenAi => {
            user_value(&mut fields, "OPENAI_TRANSCRIPTION_PROMPT", tx.openai_prompt.as_ref());
        }
    }
    if let Some(icad) = topology.service(ServiceKind::IcadTranscribe) {
        fields.push(ManagedField::value(key("ICAD_URL"), icad.url.as_str()));
        if let Some(cred) = credentials.get(&ServiceKind::IcadTranscribe) {
            fields.push(ManagedField::value(key("ICAD_API_KEY"), cred.as_str()));
        }
    }

    // AI provider
    let ai = &config.ai;
    fields.push(ManagedField::value(key("AI_PROVIDER"), ai.provider.as_str()));
    let openai_needed = ai.provider == AiProvider::OpenAi
        || tx.mode == TranscriptionMode::OpenAi;
    if openai_needed {
        user_value(&mut fields, "OPENAI_API_KEY", ai.openai_api_key.as_ref());
        fields.push(ManagedField::value(key("OPENAI_MODEL"), ai.openai_model.as_str()));
    }
    if let Some(ollama) = topology.service(ServiceKind::Ollama) {
        fields.push(ManagedField::value(key("OLLAMA_URL"), ollama.url.as_str()));
        let model = match &ai.ollama_model {
            Some(_) => ManagedField::value(key("OLLAMA_MODEL"), defaults.ollama_model.as_str()),
            None => ManagedField::seed(key("OLLAMA_MODEL"), defaults.ollama_model.as_str()),
        };
        fields.push(model);
    }

    // Geocoding
    let geo = &config.geocoding;
    fields.push(ManagedField::value(key("GEOCODING_PROVIDER"), geo.provider.as_str()));
    if let Some(env_key) = geo.provider.api_key_env() {
        user_value(&mut fields, env_key, geo.api_key.as_ref());
    }

    // Radio software and feeder credentials
    let radio = topology.radio_software.map(|k| k.name()).unwrap_or("none");
    fields.push(ManagedField::value(key("RADIO_SOFTWARE"), radio));
    for service in topology.services.iter().filter(|s| s.kind.feeder_kind().is_some()) {
        if let (Some(env_key), Some(cred)) =
            (service.kind.credential_env_key(), credentials.get(&service.kind))
        {
            fields.push(ManagedField::value(key(env_key), cred.as_str()));
        }
    }

    // Tone detection
    let tone = &config.tone_detection;
    fields.push(ManagedField::value(
        key("ENABLE_TONE_DETECTION"),
        if tone.enabled { "true" } else { "false" },
    ));
    fields.push(ManagedField::value(key("TONE_DETECTION_TYPE"), tone.detection_type.as_str()));

    // Storage
    let storage = &config.storage;
    match storage.mode {
        StorageMode::Local => fields.push(ManagedField::value(key("STORAGE_MODE"), "local")),
        StorageMode::S3 => {
            fields.push(ManagedField::value(key("STORAGE_MODE"), "s3"));
            if let Some(endpoint) = &storage.s3_endpoint {
                fields.push(ManagedField::value(key("S3_ENDPOINT"), endpoint.as_str()));
            }
            if let Some(bucket) = &storage.s3_bucket {
                fields.push(ManagedField::value(key("S3_BUCKET"), bucket.as_str()));
            }
            user_value(&mut fields, "S3_ACCESS_KEY_ID", storage.s3_access_key_id.as_ref());
            user_value(&mut fields, "S3_SECRET_ACCESS_KEY", storage.s3_secret_access_key.as_ref());
            fields.push(ManagedField::value(key("S3_REGION"), storage.s3_region.as_str()));
        }
    }

    fields
}

/// Existing value of one key in the project's `.env`, if any.
pub fn read_env_value(project_dir: &Path, name: &str) -> Option<String> {
    super::read_string_field::<EnvDoc>(&project_dir.join(ENV_FILE), &key(name))
}
