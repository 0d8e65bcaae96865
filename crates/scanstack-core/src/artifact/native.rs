//! Native configuration files of the feeder software.
//!
//! Each feeder gets its upload target and credential written in its own
//! format. Remote feeders are configured by whoever runs them and get no file.

use serde_json::{json, Value};
use std::path::Path;
use url::Url;

use super::doc::{JsonDoc, TomlDoc, YamlDoc};
use super::{ArtifactKind, ArtifactOutcome, ArtifactWriter, FieldPath, ManagedField};
use crate::config::Placement;
use crate::defaults::EffectiveDefaults;
use crate::error::Result;
use crate::secrets::Credential;
use crate::services::{FeederKind, ServiceKind, APP_SERVICE};
use crate::topology::ResolvedService;

const TRUNK_RECORDER_VERSION: u64 = 2;
const DEFAULT_CENTER_HZ: u64 = 851_000_000;
const DEFAULT_SAMPLE_RATE: u64 = 2_048_000;

/// Where a feeder keeps the credential it sends with each upload.
pub fn credential_path(kind: ServiceKind) -> Option<FieldPath> {
    let path = match kind.feeder_kind()? {
        FeederKind::Recorder => FieldPath::keys(["systems"]).index(0).key("apiKey"),
        FeederKind::StreamClient => FieldPath::keys(["stream", "api_key"]),
        FeederKind::WebScanner => FieldPath::keys(["downstreams"])
            .matching("name", APP_SERVICE)
            .key("apiKey"),
        FeederKind::Decoder => FieldPath::keys(["upload_server", "api_key"]),
    };
    Some(path)
}

fn recorder_fields(
    upload_url: &str,
    defaults: &EffectiveDefaults,
    credential: Option<&Credential>,
) -> Vec<ManagedField> {
    let sources: Vec<Value> = defaults
        .sources
        .iter()
        .map(|sdr| {
            json!({
                "center": DEFAULT_CENTER_HZ,
                "rate": DEFAULT_SAMPLE_RATE,
                "gain": 40,
                "digitalRecorders": 2,
                "driver": sdr.driver_hint,
                "device": sdr.device_string,
            })
        })
        .collect();

    let mut fields = vec![
        ManagedField::seed(FieldPath::keys(["ver"]), TRUNK_RECORDER_VERSION),
        ManagedField::seed(FieldPath::keys(["sources"]), Value::Array(sources)),
        ManagedField::seed(
            FieldPath::keys(["systems"]).index(0),
            json!({
                "shortName": "county",
                "type": "p25",
                "control_channels": [],
                "modulation": "qpsk",
                "talkgroupsFile": "talkgroups.csv",
            }),
        ),
        ManagedField::seed(FieldPath::keys(["captureDir"]), "/app/media"),
        ManagedField::seed(FieldPath::keys(["logLevel"]), "info"),
        ManagedField::value(FieldPath::keys(["uploadServer"]), upload_url),
    ];
    if let Some(cred) = credential {
        fields.push(ManagedField::value(
            FieldPath::keys(["systems"]).index(0).key("apiKey"),
            cred.as_str(),
        ));
    }
    fields
}

fn stream_client_fields(upload_url: &str, credential: Option<&Credential>) -> Vec<ManagedField> {
    let mut fields = vec![ManagedField::seed(
        FieldPath::keys(["stream", "name"]),
        "scanner-map",
    )];
    // The streaming client takes host, port and path separately
    if let Ok(url) = Url::parse(upload_url) {
        if let Some(host) = url.host_str() {
            fields.push(ManagedField::value(FieldPath::keys(["stream", "host"]), host));
        }
        if let Some(port) = url.port_or_known_default() {
            fields.push(ManagedField::value(FieldPath::keys(["stream", "port"]), port));
        }
        fields.push(ManagedField::value(FieldPath::keys(["stream", "path"]), url.path()));
    }
    if let Some(cred) = credential {
        fields.push(ManagedField::value(
            FieldPath::keys(["stream", "api_key"]),
            cred.as_str(),
        ));
    }
    fields
}

fn web_scanner_fields(upload_url: &str, credential: Option<&Credential>) -> Vec<ManagedField> {
    let entry = FieldPath::keys(["downstreams"]).matching("name", APP_SERVICE);
    let mut fields = vec![
        ManagedField::value(entry.clone().key("url"), upload_url),
        ManagedField::value(entry.clone().key("disabled"), false),
        ManagedField::seed(entry.clone().key("systems"), "*"),
    ];
    if let Some(cred) = credential {
        fields.push(ManagedField::value(entry.key("apiKey"), cred.as_str()));
    }
    fields
}

fn decoder_fields(upload_url: &str, credential: Option<&Credential>) -> Vec<ManagedField> {
    let mut fields = vec![
        ManagedField::seed(FieldPath::keys(["decoder", "trunk_file"]), "trunk.tsv"),
        ManagedField::value(FieldPath::keys(["upload_server", "url"]), upload_url),
    ];
    if let Some(cred) = credential {
        fields.push(ManagedField::value(
            FieldPath::keys(["upload_server", "api_key"]),
            cred.as_str(),
        ));
    }
    fields
}

/// Fields of a feeder's native config. Empty for remote feeders and for
/// services that are not feeders.
pub fn native_fields(
    service: &ResolvedService,
    defaults: &EffectiveDefaults,
    credential: Option<&Credential>,
) -> Vec<ManagedField> {
    if service.placement == Placement::Remote {
        return Vec::new();
    }
    let (Some(feeder), Some(upload_url)) = (service.kind.feeder_kind(), service.upload_url.as_deref())
    else {
        return Vec::new();
    };
    match feeder {
        FeederKind::Recorder => recorder_fields(upload_url, defaults, credential),
        FeederKind::StreamClient => stream_client_fields(upload_url, credential),
        FeederKind::WebScanner => web_scanner_fields(upload_url, credential),
        FeederKind::Decoder => decoder_fields(upload_url, credential),
    }
}

/// Reconcile one feeder's native config in the format it reads.
pub fn reconcile_native(
    writer: &ArtifactWriter,
    service: &ResolvedService,
    defaults: &EffectiveDefaults,
    credential: Option<&Credential>,
) -> Result<Option<ArtifactOutcome>> {
    let fields = native_fields(service, defaults, credential);
    let (Some(feeder), Some(rel)) = (service.kind.feeder_kind(), service.kind.native_config_path())
    else {
        return Ok(None);
    };
    if fields.is_empty() {
        return Ok(None);
    }
    let rel = Path::new(rel);
    let outcome = match feeder {
        FeederKind::Recorder => writer.reconcile::<JsonDoc>(rel, ArtifactKind::NativeConfig, &fields)?,
        FeederKind::WebScanner => {
            writer.reconcile::<YamlDoc>(rel, ArtifactKind::NativeConfig, &fields)?
        }
        FeederKind::StreamClient | FeederKind::Decoder => {
            writer.reconcile::<TomlDoc>(rel, ArtifactKind::NativeConfig, &fields)?
        }
    };
    Ok(Some(outcome))
}

/// Credential a feeder's existing native config carries, if any.
pub fn read_native_api_key(project_dir: &Path, kind: ServiceKind) -> Option<String> {
    let path = project_dir.join(kind.native_config_path()?);
    let field = credential_path(kind)?;
    match kind.feeder_kind()? {
        FeederKind::Recorder => super::read_string_field::<JsonDoc>(&path, &field),
        FeederKind::WebScanner => super::read_string_field::<YamlDoc>(&path, &field),
        FeederKind::StreamClient | FeederKind::Decoder => {
            super::read_string_field::<TomlDoc>(&path, &field)
        }
    }
}
