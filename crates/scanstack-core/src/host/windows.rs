//! Windows adapter: nvidia-smi ships with the driver, WMI covers the rest.
//! Packages come from winget; Docker Desktop is a GUI installer.

use super::{
    CommandSpec, GpuParser, GpuProbe, InstallMethod, PlatformAdapter, UsbListing, UsbProbe,
};
use crate::deps::Dependency;
use crate::host::macos::DOCKER_DESKTOP_URL;

#[derive(Debug, Clone, Copy)]
pub struct WindowsAdapter;

fn powershell(script: &str) -> CommandSpec {
    CommandSpec::new("powershell", ["-NoProfile", "-NonInteractive", "-Command", script])
}

impl PlatformAdapter for WindowsAdapter {
    fn gpu_probes(&self) -> Vec<GpuProbe> {
        vec![
            GpuProbe {
                command: CommandSpec::new(
                    "nvidia-smi",
                    ["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"],
                ),
                parser: GpuParser::NvidiaSmi,
            },
            GpuProbe {
                command: powershell(
                    "Get-CimInstance Win32_VideoController | Select-Object Name,AdapterRAM | ConvertTo-Json",
                ),
                parser: GpuParser::WindowsVideoController,
            },
        ]
    }

    fn usb_probe(&self) -> Option<UsbProbe> {
        Some(UsbProbe {
            command: powershell(
                "Get-PnpDevice -PresentOnly | Where-Object { $_.InstanceId -like 'USB\\VID_*' } | ForEach-Object { $_.InstanceId + ' ' + $_.FriendlyName }",
            ),
            listing: UsbListing::PnpDevices,
        })
    }

    fn install_method(&self, dependency: Dependency) -> InstallMethod {
        let id = match dependency {
            Dependency::Docker | Dependency::Compose => {
                return InstallMethod::DownloadPage {
                    url: DOCKER_DESKTOP_URL.to_string(),
                }
            }
            Dependency::Node => "OpenJS.NodeJS.LTS",
            Dependency::Python => "Python.Python.3.12",
            Dependency::Git => "Git.Git",
        };
        InstallMethod::Package {
            manager: "winget".to_string(),
            command: CommandSpec::new(
                "winget",
                [
                    "install",
                    "-e",
                    "--id",
                    id,
                    "--accept-package-agreements",
                    "--accept-source-agreements",
                ],
            )
            .streaming(),
        }
    }

    fn open_url(&self, url: &str) -> CommandSpec {
        CommandSpec::new("cmd", ["/C", "start", "", url])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nvidia_is_probed_before_wmi() {
        let probes = WindowsAdapter.gpu_probes();
        assert_eq!(probes[0].parser, GpuParser::NvidiaSmi);
        assert_eq!(probes[1].parser, GpuParser::WindowsVideoController);
    }

    #[test]
    fn test_winget_ids() {
        match WindowsAdapter.install_method(Dependency::Python) {
            InstallMethod::Package { manager, command } => {
                assert_eq!(manager, "winget");
                assert!(command.args.contains(&"Python.Python.3.12".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
