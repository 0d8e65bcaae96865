//! scanstack core - installation configuration synthesizer for scanner-map.
//!
//! Turns an `InstallationConfig` into a compose manifest, a `.env` file and
//! the native configs of the feeder software, then optionally brings the
//! stack up. Re-running with the same input changes nothing on disk.

pub mod artifact;
pub mod config;
pub mod defaults;
pub mod deps;
pub mod error;
pub mod hardware;
pub mod host;
pub mod journal;
pub mod lock;
pub mod orchestrate;
pub mod secrets;
pub mod services;
pub mod synth;
pub mod topology;

/// Synthesizer state inside a project directory (lock, backups, journal).
pub const STATE_DIR: &str = ".scanstack";

pub use config::{InstallationConfig, Placement, ServiceDescriptor, SynthSettings};
pub use error::{Result, SynthError, ValidationIssue};
pub use host::{HostCapability, SystemHost};
pub use services::ServiceKind;
pub use synth::{generate_artifacts, synthesize, SynthOptions, SynthesisReport};
pub use topology::{resolve, ResolvedTopology};
