//! Install journal: one JSON line per dependency install attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{create_dir_all, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::STATE_DIR;

const JOURNAL_FILE: &str = "install.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallLogEntry {
    pub ts: DateTime<Utc>,
    pub dependency: String,
    /// Install method as described to the user
    pub method: String,
    /// Final state name, e.g. `installed` or `still_missing`
    pub outcome: String,
    pub details: String,
}

impl InstallLogEntry {
    pub fn new(
        dependency: impl Into<String>,
        method: impl Into<String>,
        outcome: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            dependency: dependency.into(),
            method: method.into(),
            outcome: outcome.into(),
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn for_project(project_dir: &Path) -> Self {
        Self {
            path: project_dir.join(STATE_DIR).join(JOURNAL_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &InstallLogEntry) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            create_dir_all(dir).await?;
        }
        let line = serde_json::to_string(entry)? + "\n";
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// All entries so far, skipping lines that do not parse.
    pub fn read_all(&self) -> Result<Vec<InstallLogEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
