//! Hardware probing for default selection.
//!
//! Probes are advisory. Every function here returns a `ProbeOutcome` and
//! never an error: a missing tool, a timeout or unparseable output all end up
//! as `Unavailable { reason }`, and the rest of the synthesizer works with
//! whatever was found.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::host::{CommandSpec, GpuParser, HostCapability, UsbListing};

/// Result of one best-effort probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome<T> {
    Available(T),
    Unavailable { reason: String },
}

impl<T> ProbeOutcome<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        ProbeOutcome::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn available(&self) -> Option<&T> {
        match self {
            ProbeOutcome::Available(value) => Some(value),
            ProbeOutcome::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, ProbeOutcome::Available(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ProbeOutcome::Available(_) => None,
            ProbeOutcome::Unavailable { reason } => Some(reason),
        }
    }
}

/// GPU vendor detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Unknown,
}

impl GpuVendor {
    fn from_description(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("nvidia") || lower.contains("geforce") || lower.contains("quadro") {
            GpuVendor::Nvidia
        } else if lower.contains("amd")
            || lower.contains("radeon")
            || lower.contains("advanced micro devices")
            || lower.contains("ati ")
        {
            GpuVendor::Amd
        } else if lower.contains("intel") {
            GpuVendor::Intel
        } else if lower.contains("apple") {
            GpuVendor::Apple
        } else {
            GpuVendor::Unknown
        }
    }

    /// Preference when several adapters are listed: discrete first.
    fn rank(&self) -> u8 {
        match self {
            GpuVendor::Nvidia => 0,
            GpuVendor::Amd => 1,
            GpuVendor::Apple => 2,
            GpuVendor::Intel => 3,
            GpuVendor::Unknown => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub vendor: GpuVendor,
    pub model: String,
    /// Dedicated memory in GB, when the probe reports it
    pub vram_gb: Option<u64>,
    /// Found through the vendor's own tool, so the driver is loaded
    pub driver_loaded: bool,
}

impl GpuInfo {
    /// An NVIDIA GPU that containers can be given through the NVIDIA runtime.
    pub fn is_usable_nvidia(&self) -> bool {
        self.vendor == GpuVendor::Nvidia && self.driver_loaded
    }
}

/// Supported software-defined-radio families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SdrKind {
    RtlSdr,
    HackRf,
    Airspy,
    SdrPlay,
    Usrp,
}

impl SdrKind {
    /// Driver name understood by the recorder and decoder configs.
    pub fn driver_hint(&self) -> &'static str {
        match self {
            SdrKind::RtlSdr => "osmosdr",
            SdrKind::HackRf => "osmosdr",
            SdrKind::Airspy => "osmosdr",
            SdrKind::SdrPlay => "soapysdr",
            SdrKind::Usrp => "usrp",
        }
    }

    /// osmosdr-style device argument for the nth device of this family.
    pub fn device_string(&self, index: usize) -> String {
        match self {
            SdrKind::RtlSdr => format!("rtl={}", index),
            SdrKind::HackRf => format!("hackrf={}", index),
            SdrKind::Airspy => format!("airspy={}", index),
            SdrKind::SdrPlay => format!("soapy={},driver=sdrplay", index),
            SdrKind::Usrp => format!("uhd={}", index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdrDevice {
    pub kind: SdrKind,
    pub driver_hint: String,
    pub device_string: String,
    /// Description as reported by the enumeration tool
    pub description: String,
}

/// USB vendor:product signatures. An empty product matches the whole vendor.
const SDR_SIGNATURES: &[(&str, &str, SdrKind)] = &[
    ("0bda", "2838", SdrKind::RtlSdr),
    ("0bda", "2832", SdrKind::RtlSdr),
    ("1d50", "6089", SdrKind::HackRf),
    ("1d50", "60a1", SdrKind::Airspy),
    ("1df7", "", SdrKind::SdrPlay),
    ("2500", "", SdrKind::Usrp),
];

/// Name fragments for listings that carry no ids.
const SDR_NAME_HINTS: &[(&str, SdrKind)] = &[
    ("rtl2838", SdrKind::RtlSdr),
    ("rtl2832", SdrKind::RtlSdr),
    ("hackrf", SdrKind::HackRf),
    ("airspy", SdrKind::Airspy),
    ("sdrplay", SdrKind::SdrPlay),
    ("ettus", SdrKind::Usrp),
];

/// Facts about the host used to pick defaults. Recomputed on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub gpu: ProbeOutcome<GpuInfo>,
    pub sdr: ProbeOutcome<Vec<SdrDevice>>,
    pub ram_gb: Option<u64>,
    pub cpu_cores: Option<usize>,
}

impl HardwareProfile {
    /// Profile with nothing detected.
    pub fn empty() -> Self {
        Self {
            gpu: ProbeOutcome::unavailable("not probed"),
            sdr: ProbeOutcome::unavailable("not probed"),
            ram_gb: None,
            cpu_cores: None,
        }
    }

    pub fn gpu(&self) -> Option<&GpuInfo> {
        self.gpu.available()
    }

    pub fn nvidia(&self) -> Option<&GpuInfo> {
        self.gpu().filter(|g| g.is_usable_nvidia())
    }

    pub fn sdr_devices(&self) -> &[SdrDevice] {
        self.sdr.available().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Probe GPU, SDR devices and memory. Never fails.
pub async fn probe_hardware<H: HostCapability + ?Sized>(
    host: &H,
    probe_timeout: Duration,
) -> HardwareProfile {
    let gpu = host.detect_gpu(probe_timeout).await;
    let sdr = host.detect_devices(probe_timeout).await;
    let (ram_gb, cpu_cores) = match host.memory() {
        Some((ram, cores)) => (Some(ram), Some(cores)),
        None => (None, None),
    };

    info!(
        gpu = gpu
            .available()
            .map(|g| g.model.as_str())
            .unwrap_or("none"),
        sdr_devices = sdr.available().map(Vec::len).unwrap_or(0),
        ram_gb = ?ram_gb,
        "Hardware probed"
    );

    HardwareProfile {
        gpu,
        sdr,
        ram_gb,
        cpu_cores,
    }
}

/// Try each GPU tool of the platform in priority order.
pub async fn detect_gpu<H: HostCapability + ?Sized>(
    host: &H,
    probe_timeout: Duration,
) -> ProbeOutcome<GpuInfo> {
    let mut reasons = Vec::new();

    for probe in host.platform().gpu_probes() {
        let command = probe.command.timeout(probe_timeout);
        let stdout = match run_bounded(host, &command, probe_timeout).await {
            Ok(stdout) => stdout,
            Err(reason) => {
                debug!(reason = %reason, "GPU probe unavailable");
                reasons.push(reason);
                continue;
            }
        };

        match parse_gpu(probe.parser, &stdout) {
            Some(gpu) => {
                info!(vendor = ?gpu.vendor, model = %gpu.model, vram_gb = ?gpu.vram_gb, "Detected GPU");
                return ProbeOutcome::Available(gpu);
            }
            None => reasons.push(format!("{}: no GPU in output", command.program)),
        }
    }

    if reasons.is_empty() {
        reasons.push("no GPU probe for this platform".to_string());
    }
    ProbeOutcome::unavailable(reasons.join("; "))
}

/// Enumerate USB devices and match them against the SDR signature table.
pub async fn detect_sdr_devices<H: HostCapability + ?Sized>(
    host: &H,
    probe_timeout: Duration,
) -> ProbeOutcome<Vec<SdrDevice>> {
    let Some(probe) = host.platform().usb_probe() else {
        return ProbeOutcome::unavailable("no USB enumeration tool for this platform");
    };
    let command = probe.command.timeout(probe_timeout);
    let stdout = match run_bounded(host, &command, probe_timeout).await {
        Ok(stdout) => stdout,
        Err(reason) => return ProbeOutcome::unavailable(reason),
    };

    let entries = match probe.listing {
        UsbListing::Lsusb => lsusb_entries(&stdout),
        UsbListing::SystemProfilerJson => system_profiler_usb_entries(&stdout),
        UsbListing::PnpDevices => pnp_entries(&stdout),
    };
    let devices = match_sdr_devices(&entries);
    if !devices.is_empty() {
        info!(count = devices.len(), "Detected SDR devices");
    }
    ProbeOutcome::Available(devices)
}

/// Run one probe command under a hard deadline and return its stdout.
async fn run_bounded<H: HostCapability + ?Sized>(
    host: &H,
    command: &CommandSpec,
    probe_timeout: Duration,
) -> Result<String, String> {
    match timeout(probe_timeout, host.run(command)).await {
        Ok(output) if output.success() => Ok(output.stdout),
        Ok(output) => Err(output.failure_reason()),
        Err(_) => {
            warn!(command = %command.display(), "Probe timeout");
            Err(format!("{}: timeout", command.display()))
        }
    }
}

pub fn parse_gpu(parser: GpuParser, stdout: &str) -> Option<GpuInfo> {
    match parser {
        GpuParser::NvidiaSmi => parse_nvidia_smi(stdout),
        GpuParser::RocmSmi => parse_rocm_smi(stdout),
        GpuParser::Lspci => parse_lspci(stdout),
        GpuParser::SystemProfiler => parse_system_profiler_displays(stdout),
        GpuParser::WindowsVideoController => parse_windows_video_controllers(stdout),
    }
}

fn mib_to_gb(mib: u64) -> u64 {
    (mib + 512) / 1024
}

fn bytes_to_gb(bytes: u64) -> u64 {
    mib_to_gb(bytes / (1024 * 1024))
}

/// `name, memory.total` in MiB, one line per GPU; the first one wins.
fn parse_nvidia_smi(stdout: &str) -> Option<GpuInfo> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (name, mem) = line.rsplit_once(',')?;
    let vram_mib: u64 = mem.trim().parse().ok()?;
    Some(GpuInfo {
        vendor: GpuVendor::Nvidia,
        model: name.trim().to_string(),
        vram_gb: Some(mib_to_gb(vram_mib)),
        driver_loaded: true,
    })
}

/// `rocm-smi --json`: one object per card.
fn parse_rocm_smi(stdout: &str) -> Option<GpuInfo> {
    let root: Value = serde_json::from_str(stdout).ok()?;
    let cards = root.as_object()?;
    let (_, card) = cards.iter().find(|(k, _)| k.starts_with("card"))?;
    let card = card.as_object()?;

    let model = ["Card series", "Card model", "Card SKU"]
        .iter()
        .find_map(|k| card.get(*k).and_then(Value::as_str))
        .unwrap_or("AMD GPU")
        .to_string();
    let vram_gb = card
        .iter()
        .find(|(k, _)| k.starts_with("VRAM Total Memory"))
        .and_then(|(_, v)| v.as_str())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(bytes_to_gb);

    Some(GpuInfo {
        vendor: GpuVendor::Amd,
        model,
        vram_gb,
        driver_loaded: true,
    })
}

/// Display controllers from plain `lspci`. Memory is not reported.
fn parse_lspci(stdout: &str) -> Option<GpuInfo> {
    stdout
        .lines()
        .filter(|l| {
            l.contains("VGA compatible controller")
                || l.contains("3D controller")
                || l.contains("Display controller")
        })
        .filter_map(|l| {
            let (_, desc) = l.split_once("controller")?;
            let model = desc.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
            Some(GpuInfo {
                vendor: GpuVendor::from_description(model),
                model: model.trim().to_string(),
                vram_gb: None,
                driver_loaded: false,
            })
        })
        .min_by_key(|g| g.vendor.rank())
}

/// `system_profiler SPDisplaysDataType -json`
fn parse_system_profiler_displays(stdout: &str) -> Option<GpuInfo> {
    let root: Value = serde_json::from_str(stdout).ok()?;
    let items = root.get("SPDisplaysDataType")?.as_array()?;

    items
        .iter()
        .filter_map(|item| {
            let model = item
                .get("sppci_model")
                .or_else(|| item.get("_name"))
                .and_then(Value::as_str)?;
            let vendor_text = item
                .get("spdisplays_vendor")
                .and_then(Value::as_str)
                .unwrap_or(model);
            let vram_gb = ["spdisplays_vram", "spdisplays_vram_shared"]
                .iter()
                .find_map(|k| item.get(*k).and_then(Value::as_str))
                .and_then(parse_size_gb);
            let mut vendor = GpuVendor::from_description(vendor_text);
            if vendor == GpuVendor::Unknown {
                vendor = GpuVendor::from_description(model);
            }
            Some(GpuInfo {
                vendor,
                model: model.to_string(),
                vram_gb,
                driver_loaded: true,
            })
        })
        .min_by_key(|g| g.vendor.rank())
}

/// `ConvertTo-Json` yields an object for one adapter and an array for several.
fn parse_windows_video_controllers(stdout: &str) -> Option<GpuInfo> {
    let root: Value = serde_json::from_str(stdout.trim()).ok()?;
    let items = match root {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => return None,
    };

    items
        .iter()
        .filter_map(|item| {
            let model = item.get("Name").and_then(Value::as_str)?;
            let vram_gb = item
                .get("AdapterRAM")
                .and_then(Value::as_u64)
                .filter(|b| *b > 0)
                .map(bytes_to_gb);
            Some(GpuInfo {
                vendor: GpuVendor::from_description(model),
                model: model.to_string(),
                vram_gb,
                driver_loaded: false,
            })
        })
        .min_by_key(|g| g.vendor.rank())
}

/// "8 GB", "1536 MB"
fn parse_size_gb(text: &str) -> Option<u64> {
    let mut parts = text.split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    match parts.next()?.to_uppercase().as_str() {
        "GB" => Some(value),
        "MB" => Some(mib_to_gb(value)),
        _ => None,
    }
}

/// `Bus 001 Device 004: ID 0bda:2838 Realtek ...` -> `0bda:2838 realtek ...`
pub fn lsusb_entries(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|l| l.split_once(" ID ").map(|(_, rest)| rest.trim().to_lowercase()))
        .collect()
}

/// Walk the nested `_items` tree of `system_profiler SPUSBDataType -json`.
pub fn system_profiler_usb_entries(stdout: &str) -> Vec<String> {
    fn hex_id(value: Option<&Value>) -> String {
        value
            .and_then(Value::as_str)
            .and_then(|s| s.split_whitespace().next())
            .map(|s| s.trim_start_matches("0x").to_lowercase())
            .unwrap_or_default()
    }

    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => {
                if map.contains_key("vendor_id") || map.contains_key("product_id") {
                    let name = map.get("_name").and_then(Value::as_str).unwrap_or("");
                    out.push(format!(
                        "{}:{} {}",
                        hex_id(map.get("vendor_id")),
                        hex_id(map.get("product_id")),
                        name.to_lowercase()
                    ));
                }
                map.values().for_each(|v| walk(v, out));
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    if let Ok(root) = serde_json::from_str::<Value>(stdout) {
        walk(&root, &mut out);
    }
    out
}

/// `USB\VID_0BDA&PID_2838\0001 RTL2838UHIDIR` -> `0bda:2838 rtl2838uhidir`
pub fn pnp_entries(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let upper = line.to_uppercase();
            let vid_at = upper.find("VID_")?;
            let pid_at = upper.find("PID_")?;
            let vid = upper.get(vid_at + 4..vid_at + 8)?.to_lowercase();
            let pid = upper.get(pid_at + 4..pid_at + 8)?.to_lowercase();
            let name = line
                .split_once(char::is_whitespace)
                .map(|(_, n)| n.trim())
                .unwrap_or("");
            Some(format!("{}:{} {}", vid, pid, name.to_lowercase()))
        })
        .collect()
}

fn classify(entry: &str) -> Option<SdrKind> {
    let (ids, name) = entry.split_once(' ').unwrap_or((entry, ""));
    if let Some((vid, pid)) = ids.split_once(':') {
        let by_id = SDR_SIGNATURES
            .iter()
            .find(|(v, p, _)| *v == vid && (p.is_empty() || *p == pid))
            .map(|(_, _, kind)| *kind);
        if by_id.is_some() {
            return by_id;
        }
    }
    SDR_NAME_HINTS
        .iter()
        .find(|(hint, _)| name.contains(hint))
        .map(|(_, kind)| *kind)
}

/// Match normalized `vid:pid name` entries against the signature table.
/// Unknown devices are ignored.
pub fn match_sdr_devices(entries: &[String]) -> Vec<SdrDevice> {
    let mut per_kind: BTreeMap<SdrKind, usize> = BTreeMap::new();
    let mut devices = Vec::new();

    for entry in entries {
        let Some(kind) = classify(entry) else {
            continue;
        };
        let index = per_kind.entry(kind).or_insert(0);
        devices.push(SdrDevice {
            kind,
            driver_hint: kind.driver_hint().to_string(),
            device_string: kind.device_string(*index),
            description: entry.split_once(' ').map(|(_, n)| n).unwrap_or("").to_string(),
        });
        *index += 1;
    }
    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nvidia_smi_csv() {
        let gpu = parse_nvidia_smi("NVIDIA GeForce RTX 3060, 12288\n").unwrap();
        assert_eq!(gpu.vendor, GpuVendor::Nvidia);
        assert_eq!(gpu.model, "NVIDIA GeForce RTX 3060");
        assert_eq!(gpu.vram_gb, Some(12));
        assert!(gpu.is_usable_nvidia());
    }

    #[test]
    fn test_nvidia_smi_garbage_is_none() {
        assert!(parse_nvidia_smi("").is_none());
        assert!(parse_nvidia_smi("NVIDIA-SMI has failed").is_none());
    }

    #[test]
    fn test_rocm_smi_json() {
        let json = r#"{"card0": {"Card series": "Radeon RX 7900 XTX", "VRAM Total Memory (B)": "25753026560"}}"#;
        let gpu = parse_rocm_smi(json).unwrap();
        assert_eq!(gpu.vendor, GpuVendor::Amd);
        assert_eq!(gpu.model, "Radeon RX 7900 XTX");
        assert_eq!(gpu.vram_gb, Some(24));
    }

    #[test]
    fn test_lspci_prefers_discrete_and_marks_driver_unknown() {
        let out = "00:02.0 VGA compatible controller: Intel Corporation UHD Graphics 630\n\
                   01:00.0 3D controller: NVIDIA Corporation GA106M [GeForce RTX 3060 Mobile]\n\
                   00:1f.3 Audio device: Intel Corporation Cannon Lake PCH cAVS\n";
        let gpu = parse_lspci(out).unwrap();
        assert_eq!(gpu.vendor, GpuVendor::Nvidia);
        assert!(!gpu.is_usable_nvidia());
        assert_eq!(gpu.vram_gb, None);
    }

    #[test]
    fn test_system_profiler_apple_silicon() {
        let json = r#"{"SPDisplaysDataType": [{"_name": "kHW_AppleM2Item", "sppci_model": "Apple M2", "spdisplays_vendor": "sppci_vendor_Apple"}]}"#;
        let gpu = parse_system_profiler_displays(json).unwrap();
        assert_eq!(gpu.vendor, GpuVendor::Apple);
        assert_eq!(gpu.model, "Apple M2");
    }

    #[test]
    fn test_windows_single_adapter_object() {
        let json = r#"{"Name": "NVIDIA GeForce GTX 1660", "AdapterRAM": 4293918720}"#;
        let gpu = parse_windows_video_controllers(json).unwrap();
        assert_eq!(gpu.vendor, GpuVendor::Nvidia);
        assert_eq!(gpu.vram_gb, Some(4));
    }

    #[test]
    fn test_lsusb_signature_match() {
        let out = "Bus 001 Device 002: ID 8087:0024 Intel Corp. Integrated Rate Matching Hub\n\
                   Bus 001 Device 004: ID 0bda:2838 Realtek Semiconductor Corp. RTL2838 DVB-T\n\
                   Bus 001 Device 005: ID 0bda:2838 Realtek Semiconductor Corp. RTL2838 DVB-T\n\
                   Bus 002 Device 003: ID 1d50:6089 OpenMoko, Inc. Great Scott Gadgets HackRF One SDR\n";
        let devices = match_sdr_devices(&lsusb_entries(out));
        let strings: Vec<_> = devices.iter().map(|d| d.device_string.as_str()).collect();
        assert_eq!(strings, vec!["rtl=0", "rtl=1", "hackrf=0"]);
        assert_eq!(devices[0].driver_hint, "osmosdr");
    }

    #[test]
    fn test_pnp_and_profiler_listings_normalize() {
        let pnp = pnp_entries("USB\\VID_1DF7&PID_3000\\0000001 SDRplay RSP1A\n");
        assert_eq!(pnp, vec!["1df7:3000 sdrplay rsp1a".to_string()]);
        assert_eq!(match_sdr_devices(&pnp)[0].kind, SdrKind::SdrPlay);

        let json = r#"{"SPUSBDataType": [{"_items": [{"_name": "AIRSPY", "vendor_id": "0x1d50", "product_id": "0x60a1"}]}]}"#;
        let entries = system_profiler_usb_entries(json);
        assert_eq!(entries, vec!["1d50:60a1 airspy".to_string()]);
    }

    #[test]
    fn test_unmatched_devices_are_ignored() {
        let entries = vec!["046d:c52b logitech unifying receiver".to_string()];
        assert!(match_sdr_devices(&entries).is_empty());
    }

    #[test]
    fn test_empty_profile_is_safe() {
        let profile = HardwareProfile::empty();
        assert!(profile.gpu().is_none());
        assert!(profile.nvidia().is_none());
        assert!(profile.sdr_devices().is_empty());
    }
}
