//! Host capability layer.
//!
//! Every call-out to the operating system goes through `HostCapability::run`.
//! Platform differences (which GPU tools exist, how USB devices are listed,
//! which package manager installs what) live in one adapter per OS family so
//! the hardware probe and the dependency installer share a single dispatch.

mod linux;
mod macos;
mod windows;

pub use linux::LinuxAdapter;
pub use macos::MacAdapter;
pub use windows::WindowsAdapter;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::deps::Dependency;
use crate::hardware::{self, GpuInfo, ProbeOutcome, SdrDevice};

/// Maximum output kept per stream
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Linux package manager family, from /etc/os-release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Pacman,
    Zypper,
    Apk,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "family")]
pub enum OsFamily {
    Linux { package_manager: PackageManager },
    MacOs,
    Windows,
    Other,
}

impl OsFamily {
    /// Detect the OS family of the running process.
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") {
            let release = fs::read_to_string("/etc/os-release").unwrap_or_default();
            OsFamily::Linux {
                package_manager: package_manager_from_os_release(&release),
            }
        } else if cfg!(target_os = "macos") {
            OsFamily::MacOs
        } else if cfg!(target_os = "windows") {
            OsFamily::Windows
        } else {
            OsFamily::Other
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Linux { package_manager } => write!(f, "linux ({:?})", package_manager),
            OsFamily::MacOs => write!(f, "macos"),
            OsFamily::Windows => write!(f, "windows"),
            OsFamily::Other => write!(f, "other"),
        }
    }
}

/// Map `ID` / `ID_LIKE` from os-release onto a package manager.
pub fn package_manager_from_os_release(content: &str) -> PackageManager {
    let mut ids = Vec::new();
    for line in content.lines() {
        if let Some(value) = line
            .strip_prefix("ID=")
            .or_else(|| line.strip_prefix("ID_LIKE="))
        {
            ids.extend(
                value
                    .trim_matches('"')
                    .split_whitespace()
                    .map(|s| s.to_lowercase()),
            );
        }
    }

    for id in &ids {
        let pm = match id.as_str() {
            "debian" | "ubuntu" | "raspbian" | "linuxmint" | "pop" => PackageManager::Apt,
            "fedora" | "rhel" | "centos" | "rocky" | "almalinux" => PackageManager::Dnf,
            "arch" | "manjaro" | "endeavouros" => PackageManager::Pacman,
            "opensuse" | "suse" | "opensuse-leap" | "opensuse-tumbleweed" => {
                PackageManager::Zypper
            }
            "alpine" => PackageManager::Apk,
            _ => continue,
        };
        return pm;
    }
    PackageManager::Unknown
}

/// An external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Forward output lines to the log as they arrive
    pub stream: bool,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: Duration::from_secs(5),
            stream: false,
            cwd: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout_secs(self, secs: u64) -> Self {
        self.timeout(Duration::from_secs(secs))
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Rendered command line for logs and reports.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// How a command run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Success,
    NonZeroExit,
    NotFound,
    Timeout,
    OsError,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NonZeroExit => "non-zero exit",
            Self::NotFound => "command not found",
            Self::Timeout => "timeout",
            Self::OsError => "OS error",
        }
    }
}

/// Captured result of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == ExecStatus::Success
    }

    /// Both streams, for signal matching and diagnostics.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, _) => self.stderr.clone(),
            (_, true) => self.stdout.clone(),
            _ => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// Short reason for a failed run.
    pub fn failure_reason(&self) -> String {
        let detail = self
            .stderr
            .lines()
            .chain(self.stdout.lines())
            .map(str::trim)
            .find(|l| !l.is_empty());
        match (self.status, detail) {
            (ExecStatus::NonZeroExit, Some(line)) => {
                format!("{} exited {}: {}", self.command, self.exit_code.unwrap_or(-1), line)
            }
            (status, _) => format!("{}: {}", self.command, status.as_str()),
        }
    }

    pub fn synthetic(command: &str, status: ExecStatus, stdout: &str, stderr: &str) -> Self {
        Self {
            command: command.to_string(),
            status,
            exit_code: match status {
                ExecStatus::Success => Some(0),
                ExecStatus::NonZeroExit => Some(1),
                _ => None,
            },
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration_ms: 0,
        }
    }
}

/// Output parser attached to a GPU enumeration command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuParser {
    NvidiaSmi,
    RocmSmi,
    Lspci,
    SystemProfiler,
    WindowsVideoController,
}

/// One GPU enumeration attempt.
#[derive(Debug, Clone)]
pub struct GpuProbe {
    pub command: CommandSpec,
    pub parser: GpuParser,
}

/// Output shape of the USB enumeration command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbListing {
    Lsusb,
    SystemProfilerJson,
    PnpDevices,
}

#[derive(Debug, Clone)]
pub struct UsbProbe {
    pub command: CommandSpec,
    pub listing: UsbListing,
}

/// A single way of installing a dependency on this platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallMethod {
    /// Non-interactive package manager command
    Package { manager: String, command: CommandSpec },
    /// GUI installer: open the download page, then re-check after confirmation
    DownloadPage { url: String },
    Unsupported { reason: String },
}

impl InstallMethod {
    pub fn describe(&self) -> String {
        match self {
            InstallMethod::Package { manager, command } => {
                format!("{}: {}", manager, command.display())
            }
            InstallMethod::DownloadPage { url } => format!("download page {}", url),
            InstallMethod::Unsupported { reason } => format!("unsupported: {}", reason),
        }
    }
}

/// Per-OS dispatch table.
pub trait PlatformAdapter {
    fn gpu_probes(&self) -> Vec<GpuProbe>;
    fn usb_probe(&self) -> Option<UsbProbe>;
    fn install_method(&self, dependency: Dependency) -> InstallMethod;
    fn open_url(&self, url: &str) -> CommandSpec;
}

pub fn adapter_for(os: OsFamily) -> Box<dyn PlatformAdapter + Send + Sync> {
    match os {
        OsFamily::Linux { package_manager } => Box::new(LinuxAdapter::new(package_manager)),
        OsFamily::MacOs => Box::new(MacAdapter),
        OsFamily::Windows => Box::new(WindowsAdapter),
        OsFamily::Other => Box::new(LinuxAdapter::new(PackageManager::Unknown)),
    }
}

/// Everything the synthesizer needs from the machine it runs on.
#[allow(async_fn_in_trait)]
pub trait HostCapability {
    fn os(&self) -> OsFamily;

    /// Run an external command with a hard timeout. Never panics; failures
    /// are encoded in the returned status.
    async fn run(&self, spec: &CommandSpec) -> CommandOutput;

    /// Total RAM in GB and logical CPU count, when known.
    fn memory(&self) -> Option<(u64, usize)> {
        None
    }

    fn platform(&self) -> Box<dyn PlatformAdapter + Send + Sync> {
        adapter_for(self.os())
    }

    async fn detect_gpu(&self, timeout: Duration) -> ProbeOutcome<GpuInfo> {
        hardware::detect_gpu(self, timeout).await
    }

    async fn detect_devices(&self, timeout: Duration) -> ProbeOutcome<Vec<SdrDevice>> {
        hardware::detect_sdr_devices(self, timeout).await
    }
}

/// The real machine.
#[derive(Debug, Clone)]
pub struct SystemHost {
    os: OsFamily,
}

impl SystemHost {
    pub fn new() -> Self {
        Self {
            os: OsFamily::detect(),
        }
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCapability for SystemHost {
    fn os(&self) -> OsFamily {
        self.os
    }

    async fn run(&self, spec: &CommandSpec) -> CommandOutput {
        let started = Instant::now();
        let command = spec.display();
        debug!(command = %command, timeout_secs = spec.timeout.as_secs(), "Running");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let status = if e.kind() == std::io::ErrorKind::NotFound {
                    ExecStatus::NotFound
                } else {
                    ExecStatus::OsError
                };
                debug!(command = %command, error = %e, "Spawn failed");
                return CommandOutput {
                    command,
                    status,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
        };

        // Dropping the child on timeout kills it (kill_on_drop).
        let result = tokio::time::timeout(spec.timeout, collect(child, spec.stream, &spec.program)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok((code, stdout, stderr))) => {
                let status = if code == Some(0) {
                    ExecStatus::Success
                } else {
                    ExecStatus::NonZeroExit
                };
                debug!(command = %command, ?code, duration_ms, "Finished");
                CommandOutput {
                    command,
                    status,
                    exit_code: code,
                    stdout,
                    stderr,
                    duration_ms,
                }
            }
            Ok(Err(e)) => {
                warn!(command = %command, error = %e, "Command I/O error");
                CommandOutput {
                    command,
                    status: ExecStatus::OsError,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    duration_ms,
                }
            }
            Err(_) => {
                warn!(command = %command, timeout_secs = spec.timeout.as_secs(), "Command timed out");
                CommandOutput {
                    command,
                    status: ExecStatus::Timeout,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("timed out after {}s", spec.timeout.as_secs()),
                    duration_ms,
                }
            }
        }
    }

    fn memory(&self) -> Option<(u64, usize)> {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        sys.refresh_cpu();
        let ram_gb = sys.total_memory() / (1024 * 1024 * 1024);
        let cores = sys.cpus().len();
        if ram_gb == 0 && cores == 0 {
            None
        } else {
            Some((ram_gb, cores))
        }
    }
}

async fn collect(
    mut child: tokio::process::Child,
    stream: bool,
    label: &str,
) -> std::io::Result<(Option<i32>, String, String)> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (out, err) = tokio::join!(
        read_lines(stdout, stream, label),
        read_lines(stderr, stream, label)
    );
    let status = child.wait().await?;
    Ok((status.code(), out?, err?))
}

async fn read_lines<R: AsyncRead + Unpin>(
    reader: Option<R>,
    stream: bool,
    label: &str,
) -> std::io::Result<String> {
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut collected = String::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);
        if stream {
            info!(target: "scanstack::host", "[{}] {}", label, line);
        }
        if collected.len() < MAX_OUTPUT_BYTES {
            collected.push_str(line);
            collected.push('\n');
        }
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_release_maps_to_package_manager() {
        let ubuntu = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\n";
        assert_eq!(package_manager_from_os_release(ubuntu), PackageManager::Apt);

        let rocky = "ID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n";
        assert_eq!(package_manager_from_os_release(rocky), PackageManager::Dnf);

        let arch = "ID=arch\n";
        assert_eq!(package_manager_from_os_release(arch), PackageManager::Pacman);

        assert_eq!(package_manager_from_os_release(""), PackageManager::Unknown);
    }

    #[test]
    fn test_failure_reason_prefers_first_stderr_line() {
        let out = CommandOutput::synthetic(
            "docker compose up -d",
            ExecStatus::NonZeroExit,
            "",
            "\nError: port is already allocated\nmore",
        );
        assert_eq!(
            out.failure_reason(),
            "docker compose up -d exited 1: Error: port is already allocated"
        );

        let missing = CommandOutput::synthetic("nvidia-smi", ExecStatus::NotFound, "", "");
        assert_eq!(missing.failure_reason(), "nvidia-smi: command not found");
    }

    #[tokio::test]
    async fn test_missing_program_reports_not_found() {
        let host = SystemHost::new();
        let out = host
            .run(&CommandSpec::new("scanstack-definitely-not-a-real-tool", ["--version"]))
            .await;
        assert_eq!(out.status, ExecStatus::NotFound);
        assert!(!out.success());
    }
}
