//! Error types for the installation synthesizer.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// One problem found while validating an `InstallationConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Dotted location of the offending value, e.g. `services.ollama.url`
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug)]
pub enum SynthError {
    #[error("Invalid installation config ({} issue(s)): {}", .0.len(), join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("Required host tools still missing: {}", .missing.join(", "))]
    HostDependency { missing: Vec<String> },

    #[error("Artifact error at {}: {message}", .path.display())]
    Artifact { path: PathBuf, message: String },

    #[error("Orchestration error: {0}")]
    Orchestration(String),

    #[error("{message}")]
    Fatal {
        message: String,
        diagnostics: String,
    },

    #[error("Project directory is locked by another synthesis run ({holder})")]
    Locked { holder: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML render error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl SynthError {
    /// Process exit code for the CLI wrapper.
    pub fn exit_code(&self) -> i32 {
        match self {
            SynthError::Validation(_) => 65,
            SynthError::HostDependency { .. } => 69,
            SynthError::Fatal { .. } => 70,
            SynthError::Locked { .. } => 75,
            SynthError::Artifact { .. }
            | SynthError::Orchestration(_)
            | SynthError::Io(_)
            | SynthError::Json(_)
            | SynthError::Yaml(_)
            | SynthError::TomlDe(_)
            | SynthError::TomlSer(_) => 1,
        }
    }

    pub fn artifact(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        SynthError::Artifact {
            path: path.into(),
            message: message.into(),
        }
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, SynthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_every_issue() {
        let err = SynthError::Validation(vec![
            ValidationIssue::new("services.ollama.url", "required for remote placement"),
            ValidationIssue::new("network.api_port", "collides with webserver_port"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 issue(s)"));
        assert!(msg.contains("services.ollama.url"));
        assert!(msg.contains("network.api_port"));
        assert_eq!(err.exit_code(), 65);
    }

    #[test]
    fn test_exit_codes_are_distinct_for_terminal_failures() {
        let dep = SynthError::HostDependency {
            missing: vec!["docker".to_string()],
        };
        let fatal = SynthError::Fatal {
            message: "nothing started".to_string(),
            diagnostics: String::new(),
        };
        let locked = SynthError::Locked {
            holder: "pid 42".to_string(),
        };
        assert_eq!(dep.exit_code(), 69);
        assert_eq!(fatal.exit_code(), 70);
        assert_eq!(locked.exit_code(), 75);
        assert!(dep.to_string().contains("docker"));
    }
}
