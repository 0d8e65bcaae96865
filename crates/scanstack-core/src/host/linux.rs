//! Linux adapter: vendor tools first, lspci as the last GPU fallback, lsusb
//! for SDR dongles, and the distro package manager for installs.

use super::{
    CommandSpec, GpuParser, GpuProbe, InstallMethod, PackageManager, PlatformAdapter, UsbListing,
    UsbProbe,
};
use crate::deps::Dependency;

#[derive(Debug, Clone, Copy)]
pub struct LinuxAdapter {
    package_manager: PackageManager,
}

impl LinuxAdapter {
    pub fn new(package_manager: PackageManager) -> Self {
        Self { package_manager }
    }

    fn package_name(&self, dependency: Dependency) -> Option<&'static str> {
        use PackageManager::*;
        let name = match (dependency, self.package_manager) {
            (_, Unknown) => return None,
            (Dependency::Docker, Apt) => "docker.io",
            (Dependency::Docker, Dnf) => "moby-engine",
            (Dependency::Docker, Pacman | Zypper | Apk) => "docker",
            (Dependency::Compose, Apt) => "docker-compose-v2",
            (Dependency::Compose, Dnf | Pacman | Zypper) => "docker-compose",
            (Dependency::Compose, Apk) => "docker-cli-compose",
            (Dependency::Node, _) => "nodejs",
            (Dependency::Python, Pacman) => "python",
            (Dependency::Python, _) => "python3",
            (Dependency::Git, _) => "git",
        };
        Some(name)
    }
}

impl PlatformAdapter for LinuxAdapter {
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
                command: CommandSpec::new(
                    "rocm-smi",
                    ["--showproductname", "--showmeminfo", "vram", "--json"],
                ),
                parser: GpuParser::RocmSmi,
            },
            GpuProbe {
                command: CommandSpec::new("lspci", Vec::<String>::new()),
                parser: GpuParser::Lspci,
            },
        ]
    }

    fn usb_probe(&self) -> Option<UsbProbe> {
        Some(UsbProbe {
            command: CommandSpec::new("lsusb", Vec::<String>::new()),
            listing: UsbListing::Lsusb,
        })
    }

    fn install_method(&self, dependency: Dependency) -> InstallMethod {
        let Some(package) = self.package_name(dependency) else {
            return InstallMethod::Unsupported {
                reason: "no supported package manager detected".to_string(),
            };
        };

        let (manager, args): (&str, Vec<&str>) = match self.package_manager {
            PackageManager::Apt => ("apt", vec!["apt-get", "install", "-y", package]),
            PackageManager::Dnf => ("dnf", vec!["dnf", "install", "-y", package]),
            PackageManager::Pacman => (
                "pacman",
                vec!["pacman", "-S", "--needed", "--noconfirm", package],
            ),
            PackageManager::Zypper => (
                "zypper",
                vec!["zypper", "--non-interactive", "install", package],
            ),
            PackageManager::Apk | PackageManager::Unknown => ("apk", vec!["apk", "add", package]),
        };

        InstallMethod::Package {
            manager: manager.to_string(),
            command: CommandSpec::new("sudo", args).streaming(),
        }
    }

    fn open_url(&self, url: &str) -> CommandSpec {
        CommandSpec::new("xdg-open", [url])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_probe_order_is_vendor_first() {
        let probes = LinuxAdapter::new(PackageManager::Apt).gpu_probes();
        let parsers: Vec<_> = probes.iter().map(|p| p.parser).collect();
        assert_eq!(
            parsers,
            vec![GpuParser::NvidiaSmi, GpuParser::RocmSmi, GpuParser::Lspci]
        );
    }

    #[test]
    fn test_pacman_install_uses_needed_flag() {
        let method = LinuxAdapter::new(PackageManager::Pacman).install_method(Dependency::Docker);
        match method {
            InstallMethod::Package { manager, command } => {
                assert_eq!(manager, "pacman");
                assert_eq!(command.program, "sudo");
                assert!(command.args.contains(&"--needed".to_string()));
                assert!(command.args.contains(&"docker".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_distro_is_unsupported() {
        let method = LinuxAdapter::new(PackageManager::Unknown).install_method(Dependency::Git);
        assert!(matches!(method, InstallMethod::Unsupported { .. }));
    }
}
