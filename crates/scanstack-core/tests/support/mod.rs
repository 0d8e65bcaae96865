//! Scripted host for integration tests: no process is ever spawned.

#![allow(dead_code)]

use scanstack_core::hardware::{GpuInfo, ProbeOutcome, SdrDevice};
use scanstack_core::host::{
    CommandOutput, CommandSpec, ExecStatus, HostCapability, OsFamily, PackageManager,
};
use std::sync::Mutex;
use std::time::Duration;

/// Answers commands by the end of their rendered command line.
pub struct FakeHost {
    rules: Vec<(String, CommandOutput)>,
    calls: Mutex<Vec<String>>,
    os: OsFamily,
    gpu: ProbeOutcome<GpuInfo>,
    devices: ProbeOutcome<Vec<SdrDevice>>,
}

impl FakeHost {
    /// A host with nothing installed and no hardware.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            calls: Mutex::new(Vec::new()),
            os: OsFamily::Linux {
                package_manager: PackageManager::Apt,
            },
            gpu: ProbeOutcome::unavailable("no GPU tool"),
            devices: ProbeOutcome::unavailable("no USB tool"),
        }
    }

    /// Commands whose line ends with `suffix` succeed with `stdout`.
    pub fn ok(mut self, suffix: &str, stdout: &str) -> Self {
        let out = CommandOutput::synthetic(suffix, ExecStatus::Success, stdout, "");
        self.rules.push((suffix.to_string(), out));
        self
    }

    /// Commands whose line ends with `suffix` exit 1 with `stderr`.
    pub fn fail(mut self, suffix: &str, stderr: &str) -> Self {
        let out = CommandOutput::synthetic(suffix, ExecStatus::NonZeroExit, "", stderr);
        self.rules.push((suffix.to_string(), out));
        self
    }

    pub fn with_os(mut self, os: OsFamily) -> Self {
        self.os = os;
        self
    }

    pub fn with_gpu(mut self, gpu: GpuInfo) -> Self {
        self.gpu = ProbeOutcome::Available(gpu);
        self
    }

    pub fn with_devices(mut self, devices: Vec<SdrDevice>) -> Self {
        self.devices = ProbeOutcome::Available(devices);
        self
    }

    /// Every command line run so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl HostCapability for FakeHost {
    fn os(&self) -> OsFamily {
        self.os
    }

    async fn run(&self, spec: &CommandSpec) -> CommandOutput {
        let line = spec.display();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line.clone());
        }
        match self.rules.iter().find(|(suffix, _)| line.ends_with(suffix.as_str())) {
            Some((_, out)) => CommandOutput {
                command: line,
                ..out.clone()
            },
            None => CommandOutput::synthetic(&line, ExecStatus::NotFound, "", ""),
        }
    }

    fn memory(&self) -> Option<(u64, usize)> {
        None
    }

    async fn detect_gpu(&self, _timeout: Duration) -> ProbeOutcome<GpuInfo> {
        self.gpu.clone()
    }

    async fn detect_devices(&self, _timeout: Duration) -> ProbeOutcome<Vec<SdrDevice>> {
        self.devices.clone()
    }
}

/// The tools a compose stack needs, all present.
pub fn docker_host() -> FakeHost {
    FakeHost::new()
        .ok("docker --version", "Docker version 27.3.1, build ce12230")
        .ok("docker compose version", "Docker Compose version v2.29.7")
}
