//! Hardware-driven defaults. User overrides in the config always win; the
//! profile only fills what the user left open.

use serde::Serialize;
use tracing::info;

use crate::config::{InstallationConfig, TranscriptionDevice};
use crate::hardware::{HardwareProfile, SdrDevice, SdrKind};

/// Minimum VRAM for running whisper on the GPU.
const CUDA_MIN_VRAM_GB: u64 = 4;

/// Values picked for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveDefaults {
    pub device: TranscriptionDevice,
    pub compute_type: String,
    pub whisper_model: String,
    pub ollama_model: String,
    /// Reserve the NVIDIA GPU for GPU-capable in-stack services
    pub gpu_reservation: bool,
    /// Recorder sources, one per detected SDR (never empty)
    pub sources: Vec<SdrDevice>,
}

pub fn select_defaults(config: &InstallationConfig, hardware: &HardwareProfile) -> EffectiveDefaults {
    let nvidia = hardware.nvidia();
    let vram_gb = nvidia.and_then(|g| g.vram_gb);

    let hw_device = match vram_gb {
        Some(vram) if vram >= CUDA_MIN_VRAM_GB => TranscriptionDevice::Cuda,
        _ => TranscriptionDevice::Cpu,
    };
    let device = config.transcription.device.unwrap_or(hw_device);

    let compute_type = match device {
        TranscriptionDevice::Cuda => "float16",
        TranscriptionDevice::Cpu => "int8",
    };

    let whisper_model = config
        .transcription
        .whisper_model
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| select_whisper_model(device, vram_gb, hardware.ram_gb).to_string());

    let ollama_model = config
        .ai
        .ollama_model
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| select_ollama_model(vram_gb, hardware.ram_gb).to_string());

    let sources = if hardware.sdr_devices().is_empty() {
        vec![default_source()]
    } else {
        hardware.sdr_devices().to_vec()
    };

    let defaults = EffectiveDefaults {
        device,
        compute_type: compute_type.to_string(),
        whisper_model,
        ollama_model,
        gpu_reservation: nvidia.is_some(),
        sources,
    };

    info!(
        "Defaults: device={} model={} ollama={} gpu_reservation={} sources={}",
        defaults.device.as_str(),
        defaults.whisper_model,
        defaults.ollama_model,
        defaults.gpu_reservation,
        defaults.sources.len()
    );
    defaults
}

fn select_whisper_model(
    device: TranscriptionDevice,
    vram_gb: Option<u64>,
    ram_gb: Option<u64>,
) -> &'static str {
    match device {
        TranscriptionDevice::Cuda => match vram_gb.unwrap_or(0) {
            v if v >= 10 => "large-v3",
            v if v >= 6 => "medium",
            _ => "small",
        },
        TranscriptionDevice::Cpu => match ram_gb {
            Some(r) if r >= 16 => "small",
            Some(r) if r >= 8 => "base",
            Some(_) => "tiny",
            None => "base",
        },
    }
}

fn select_ollama_model(vram_gb: Option<u64>, ram_gb: Option<u64>) -> &'static str {
    let vram = vram_gb.unwrap_or(0);
    match ram_gb {
        _ if vram >= 8 => "llama3.1:8b",
        Some(r) if r >= 16 => "llama3.1:8b",
        Some(r) if r >= 8 => "llama3.2:3b",
        Some(_) => "llama3.2:1b",
        None => "llama3.2:3b",
    }
}

fn default_source() -> SdrDevice {
    let kind = SdrKind::RtlSdr;
    SdrDevice {
        kind,
        driver_hint: kind.driver_hint().to_string(),
        device_string: kind.device_string(0),
        description: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{GpuInfo, GpuVendor, ProbeOutcome};

    fn with_gpu(vendor: GpuVendor, vram: u64, driver_loaded: bool) -> HardwareProfile {
        HardwareProfile {
            gpu: ProbeOutcome::Available(GpuInfo {
                vendor,
                model: "test".to_string(),
                vram_gb: Some(vram),
                driver_loaded,
            }),
            ram_gb: Some(32),
            ..HardwareProfile::empty()
        }
    }

    #[test]
    fn test_empty_profile_uses_documented_defaults() {
        let d = select_defaults(&InstallationConfig::default(), &HardwareProfile::empty());
        assert_eq!(d.device, TranscriptionDevice::Cpu);
        assert_eq!(d.compute_type, "int8");
        assert_eq!(d.whisper_model, "base");
        assert_eq!(d.ollama_model, "llama3.2:3b");
        assert!(!d.gpu_reservation);
        assert_eq!(d.sources.len(), 1);
        assert_eq!(d.sources[0].device_string, "rtl=0");
    }

    #[test]
    fn test_large_nvidia_gpu_picks_cuda() {
        let d = select_defaults(
            &InstallationConfig::default(),
            &with_gpu(GpuVendor::Nvidia, 12, true),
        );
        assert_eq!(d.device, TranscriptionDevice::Cuda);
        assert_eq!(d.compute_type, "float16");
        assert_eq!(d.whisper_model, "large-v3");
        assert_eq!(d.ollama_model, "llama3.1:8b");
        assert!(d.gpu_reservation);
    }

    #[test]
    fn test_amd_or_driverless_gpu_stays_on_cpu() {
        let amd = select_defaults(&InstallationConfig::default(), &with_gpu(GpuVendor::Amd, 16, true));
        assert_eq!(amd.device, TranscriptionDevice::Cpu);
        assert!(!amd.gpu_reservation);

        let lspci_only =
            select_defaults(&InstallationConfig::default(), &with_gpu(GpuVendor::Nvidia, 8, false));
        assert_eq!(lspci_only.device, TranscriptionDevice::Cpu);
    }

    #[test]
    fn test_user_overrides_win() {
        let mut config = InstallationConfig::default();
        config.transcription.device = Some(TranscriptionDevice::Cpu);
        config.transcription.whisper_model = Some("medium.en".to_string());
        config.ai.ollama_model = Some("mistral:7b".to_string());
        let d = select_defaults(&config, &with_gpu(GpuVendor::Nvidia, 24, true));
        assert_eq!(d.device, TranscriptionDevice::Cpu);
        assert_eq!(d.compute_type, "int8");
        assert_eq!(d.whisper_model, "medium.en");
        assert_eq!(d.ollama_model, "mistral:7b");
    }
}
