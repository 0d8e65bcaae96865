//! Compose manifest generator (`docker-compose.yml`).
//!
//! The application service and each in-stack service are seeded as complete
//! entries the first time and afterwards only their managed keys are
//! corrected. Known services that are not in the stack are removed, so a
//! service moved to remote placement never keeps a stale entry.

use serde_json::{json, Value};
use std::path::Path;

use super::doc::YamlDoc;
use super::{FieldPath, ManagedField};
use crate::config::{InstallPlacement, InstallationConfig};
use crate::defaults::EffectiveDefaults;
use crate::secrets::Credentials;
use crate::services::{ImageSource, ServiceKind, APP_SERVICE, STACK_NETWORK};
use crate::topology::{ResolvedService, ResolvedTopology, HOST_GATEWAY};

pub const MANIFEST_FILE: &str = "docker-compose.yml";

const PROJECT_NAME: &str = "scanstack";
const APP_IMAGE: &str = "scanner-map:latest";
const OLLAMA_VOLUME: &str = "ollama-data";
const USB_PASSTHROUGH: &str = "/dev/bus/usb:/dev/bus/usb";

fn service_path(name: &str) -> FieldPath {
    FieldPath::keys(["services", name])
}

fn gpu_devices() -> Value {
    json!([{ "driver": "nvidia", "count": "all", "capabilities": ["gpu"] }])
}

fn gpu_path(name: &str) -> FieldPath {
    service_path(name).key("deploy").key("resources").key("reservations").key("devices")
}

/// Services the application may wait on: in-stack and pulled from a
/// registry. Build-from-source services can be missing and stay out.
pub fn app_depends_on(topology: &ResolvedTopology) -> Vec<String> {
    topology
        .in_stack()
        .filter(|s| matches!(s.kind.image(), Some(ImageSource::Pull(_))))
        .map(|s| s.kind.name().to_string())
        .collect()
}

fn app_fields(config: &InstallationConfig, topology: &ResolvedTopology) -> Vec<ManagedField> {
    let net = &config.network;
    let path = service_path(APP_SERVICE);
    let ports = json!([
        format!("{0}:{0}", net.webserver_port),
        format!("{0}:{0}", net.api_port)
    ]);
    let depends_on = app_depends_on(topology);
    let healthcheck = json!({
        "test": ["CMD", "curl", "-f", format!("http://localhost:{}/", net.webserver_port)],
        "interval": "30s",
        "timeout": "10s",
        "retries": 3,
        "start_period": "40s"
    });

    let mut entry = json!({
        "build": ".",
        "image": APP_IMAGE,
        "container_name": APP_SERVICE,
        "restart": "unless-stopped",
        "ports": ports,
        "env_file": [".env"],
        "volumes": ["./data:/app/data", "./audio:/app/audio", "./logs:/app/logs"],
        "networks": [STACK_NETWORK],
        "healthcheck": healthcheck,
    });
    if !depends_on.is_empty() {
        entry["depends_on"] = json!(depends_on);
    }

    let mut fields = vec![
        ManagedField::seed(path.clone(), entry),
        ManagedField::value(path.clone().key("build"), "."),
        ManagedField::value(path.clone().key("image"), APP_IMAGE),
        ManagedField::value(path.clone().key("ports"), ports),
        ManagedField::value(path.clone().key("env_file"), json!([".env"])),
        ManagedField::value(path.clone().key("networks"), json!([STACK_NETWORK])),
        ManagedField::value(path.clone().key("healthcheck"), healthcheck),
    ];
    fields.push(if depends_on.is_empty() {
        ManagedField::absent(path.key("depends_on"))
    } else {
        ManagedField::value(path.key("depends_on"), json!(depends_on))
    });
    fields
}

fn optional_service_fields(
    config: &InstallationConfig,
    service: &ResolvedService,
    defaults: &EffectiveDefaults,
    credentials: &Credentials,
) -> Vec<ManagedField> {
    let kind = service.kind;
    let name = kind.name();
    let path = service_path(name);
    let Some(image) = kind.image() else {
        return Vec::new();
    };

    let port = kind.endpoint().port;
    let ports = json!([format!("{0}:{0}", port)]);

    let mut volumes = Vec::new();
    if kind == ServiceKind::Ollama {
        volumes.push(format!("{}:/root/.ollama", OLLAMA_VOLUME));
    }
    if let (Some(config_path), Some(mount)) = (kind.native_config_path(), kind.native_config_mount()) {
        volumes.push(format!("./{}:{}", config_path, mount));
    }

    let api_key = credentials.get(&kind).filter(|_| kind.needs_credential());
    let gpu = kind.wants_gpu() && defaults.gpu_reservation;
    let host_gateway = config.installation == InstallPlacement::Local && kind.feeder_kind().is_some();

    // Complete entry for the first write
    let mut entry = serde_json::Map::new();
    match image {
        ImageSource::Pull(image) => {
            entry.insert("image".into(), json!(image));
        }
        ImageSource::Build { context, image } => {
            entry.insert("build".into(), json!(context));
            entry.insert("image".into(), json!(image));
        }
    }
    entry.insert("container_name".into(), json!(name));
    entry.insert("restart".into(), json!("unless-stopped"));
    entry.insert("ports".into(), ports.clone());
    if !volumes.is_empty() {
        entry.insert("volumes".into(), json!(volumes));
    }
    if let Some(key) = api_key {
        entry.insert("environment".into(), json!({ "API_KEY": key.as_str() }));
    }
    if kind.wants_usb() {
        entry.insert("devices".into(), json!([USB_PASSTHROUGH]));
    }
    if gpu {
        entry.insert(
            "deploy".into(),
            json!({ "resources": { "reservations": { "devices": gpu_devices() } } }),
        );
    }
    if host_gateway {
        entry.insert("extra_hosts".into(), json!([format!("{}:host-gateway", HOST_GATEWAY)]));
    }
    entry.insert("networks".into(), json!([STACK_NETWORK]));

    let mut fields = vec![ManagedField::seed(path.clone(), Value::Object(entry))];
    match image {
        ImageSource::Pull(image) => {
            fields.push(ManagedField::value(path.clone().key("image"), image));
        }
        ImageSource::Build { context, image } => {
            fields.push(ManagedField::value(path.clone().key("build"), context));
            fields.push(ManagedField::value(path.clone().key("image"), image));
        }
    }
    fields.push(ManagedField::value(path.clone().key("ports"), ports));
    if !volumes.is_empty() {
        fields.push(ManagedField::value(path.clone().key("volumes"), json!(volumes)));
    }
    fields.push(ManagedField::value(path.clone().key("networks"), json!([STACK_NETWORK])));
    if let Some(key) = api_key {
        fields.push(ManagedField::value(
            path.clone().key("environment").key("API_KEY"),
            key.as_str(),
        ));
    }
    if kind.wants_usb() {
        fields.push(ManagedField::value(path.clone().key("devices"), json!([USB_PASSTHROUGH])));
    }
    fields.push(if gpu {
        ManagedField::value(gpu_path(name), gpu_devices())
    } else {
        ManagedField::absent(gpu_path(name))
    });
    fields.push(if host_gateway {
        ManagedField::value(
            path.key("extra_hosts"),
            json!([format!("{}:host-gateway", HOST_GATEWAY)]),
        )
    } else {
        ManagedField::absent(path.key("extra_hosts"))
    });
    fields
}

/// Fields of the compose manifest. Empty when the topology needs no stack.
pub fn manifest_fields(
    config: &InstallationConfig,
    topology: &ResolvedTopology,
    defaults: &EffectiveDefaults,
    credentials: &Credentials,
) -> Vec<ManagedField> {
    if !topology.needs_manifest() {
        return Vec::new();
    }

    let mut fields = vec![ManagedField::seed(FieldPath::keys(["name"]), PROJECT_NAME)];

    if topology.app_in_stack() {
        fields.extend(app_fields(config, topology));
    } else {
        fields.push(ManagedField::absent(service_path(APP_SERVICE)));
    }

    for kind in ServiceKind::ALL {
        match topology.service(kind).filter(|s| s.is_in_stack()) {
            Some(service) => {
                fields.extend(optional_service_fields(config, service, defaults, credentials))
            }
            None => fields.push(ManagedField::absent(service_path(kind.name()))),
        }
    }

    fields.push(ManagedField::value(
        FieldPath::keys(["networks", STACK_NETWORK]),
        json!({ "driver": "bridge" }),
    ));
    if topology.service(ServiceKind::Ollama).is_some_and(|s| s.is_in_stack()) {
        fields.push(ManagedField::value(
            FieldPath::keys(["volumes", OLLAMA_VOLUME]),
            json!({}),
        ));
    }
    fields
}

/// `API_KEY` of a service in an existing manifest.
pub fn read_manifest_api_key(project_dir: &Path, kind: ServiceKind) -> Option<String> {
    super::read_string_field::<YamlDoc>(
        &project_dir.join(MANIFEST_FILE),
        &service_path(kind.name()).key("environment").key("API_KEY"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Placement, ServiceDescriptor};
    use crate::defaults::select_defaults;
    use crate::hardware::HardwareProfile;
    use crate::topology::resolve;

    #[test]
    fn test_build_image_services_stay_out_of_depends_on() {
        let config = InstallationConfig::default()
            .with_service(ServiceDescriptor::new(ServiceKind::Ollama, Placement::InStack))
            .with_service(ServiceDescriptor::new(ServiceKind::IcadTranscribe, Placement::InStack))
            .with_service(ServiceDescriptor::new(ServiceKind::TrunkRecorder, Placement::InStack));
        let topo = resolve(&config).unwrap();
        assert_eq!(app_depends_on(&topo), vec!["ollama", "trunk-recorder"]);
    }

    #[test]
    fn test_remote_services_are_removed_not_generated() {
        let config = InstallationConfig::default().with_service(
            ServiceDescriptor::new(ServiceKind::Ollama, Placement::Remote)
                .with_url("http://gpu-box:11434"),
        );
        let topo = resolve(&config).unwrap();
        let defaults = select_defaults(&config, &HardwareProfile::empty());
        let fields = manifest_fields(&config, &topo, &defaults, &Credentials::new());

        let ollama = service_path("ollama");
        assert!(fields.contains(&ManagedField::absent(ollama.clone())));
        assert!(!fields
            .iter()
            .any(|f| f.path == ollama && f.is_managed() && f.desired != super::super::Desired::Absent));
        assert!(!fields.iter().any(|f| f.path.to_string() == "volumes.ollama-data"));
    }

    #[test]
    fn test_local_install_without_in_stack_services_has_no_manifest() {
        let mut config = InstallationConfig::default()
            .with_service(
                ServiceDescriptor::new(ServiceKind::Ollama, Placement::Local)
                    .with_url("http://localhost:11434"),
            );
        config.installation = InstallPlacement::Local;
        let topo = resolve(&config).unwrap();
        let defaults = select_defaults(&config, &HardwareProfile::empty());
        assert!(manifest_fields(&config, &topo, &defaults, &Credentials::new()).is_empty());
    }
}
