//! macOS adapter. Docker Desktop is a GUI installer; everything else goes
//! through Homebrew.

use super::{
    CommandSpec, GpuParser, GpuProbe, InstallMethod, PlatformAdapter, UsbListing, UsbProbe,
};
use crate::deps::Dependency;

pub const DOCKER_DESKTOP_URL: &str = "https://www.docker.com/products/docker-desktop/";

#[derive(Debug, Clone, Copy)]
pub struct MacAdapter;

impl PlatformAdapter for MacAdapter {
    fn gpu_probes(&self) -> Vec<GpuProbe> {
        vec![GpuProbe {
            command: CommandSpec::new("system_profiler", ["SPDisplaysDataType", "-json"]),
            parser: GpuParser::SystemProfiler,
        }]
    }

    fn usb_probe(&self) -> Option<UsbProbe> {
        Some(UsbProbe {
            command: CommandSpec::new("system_profiler", ["SPUSBDataType", "-json"]),
            listing: UsbListing::SystemProfilerJson,
        })
    }

    fn install_method(&self, dependency: Dependency) -> InstallMethod {
        let formula = match dependency {
            // Compose ships inside Docker Desktop
            Dependency::Docker | Dependency::Compose => {
                return InstallMethod::DownloadPage {
                    url: DOCKER_DESKTOP_URL.to_string(),
                }
            }
            Dependency::Node => "node",
            Dependency::Python => "python",
            Dependency::Git => "git",
        };
        InstallMethod::Package {
            manager: "brew".to_string(),
            command: CommandSpec::new("brew", ["install", formula]).streaming(),
        }
    }

    fn open_url(&self, url: &str) -> CommandSpec {
        CommandSpec::new("open", [url])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_is_gui_install() {
        assert_eq!(
            MacAdapter.install_method(Dependency::Compose),
            InstallMethod::DownloadPage {
                url: DOCKER_DESKTOP_URL.to_string()
            }
        );
        assert!(matches!(
            MacAdapter.install_method(Dependency::Node),
            InstallMethod::Package { .. }
        ));
    }
}
