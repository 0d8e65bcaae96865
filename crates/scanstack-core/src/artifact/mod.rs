//! Artifact reconciliation.
//!
//! Every generator describes its artifact as a list of `ManagedField`s and
//! hands it to `ArtifactWriter::reconcile`, which applies the same algorithm
//! to every file regardless of format:
//!
//! - missing or empty file: build a fresh document from the fields (create)
//! - every managed field already correct: leave the file alone (no-op)
//! - some fields stale: patch only those, keep everything else (update)
//! - unparseable file: back it up and recreate it, with a warning
//!
//! Writes go to a sibling temp file that is renamed into place, so a step
//! either fully writes its file or leaves the previous one untouched.

pub mod doc;
pub mod envfile;
pub mod manifest;
pub mod native;

use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Result, SynthError};
use crate::STATE_DIR;

const BACKUP_DIR: &str = "backups";

/// One step of a path into a structured document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Key(String),
    Index(usize),
    /// The element of a list whose `key` field equals `value`
    Match { key: String, value: String },
}

/// Location of a field inside an artifact, e.g. `systems[0].apiKey`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath(Vec<Segment>);

impl FieldPath {
    pub fn root() -> Self {
        FieldPath(Vec::new())
    }

    /// Path made of plain keys only.
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldPath(keys.into_iter().map(|k| Segment::Key(k.into())).collect())
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.0.push(Segment::Key(key.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.0.push(Segment::Index(index));
        self
    }

    pub fn matching(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push(Segment::Match {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                Segment::Key(key) if i == 0 => write!(f, "{}", key)?,
                Segment::Key(key) => write!(f, ".{}", key)?,
                Segment::Index(idx) => write!(f, "[{}]", idx)?,
                Segment::Match { key, value } => write!(f, "[{}={}]", key, value)?,
            }
        }
        Ok(())
    }
}

/// A parsed artifact that fields can be read from and patched into.
pub trait Document: Sized {
    /// Document with no content, used for fresh artifacts.
    fn empty() -> Self;

    /// `Err` carries a human-readable parse failure.
    fn parse(text: &str) -> std::result::Result<Self, String>;

    fn render(&self) -> Result<String>;

    fn get(&self, path: &FieldPath) -> Option<Value>;

    /// Set a value, creating intermediate containers as needed.
    fn set(&mut self, path: &FieldPath, value: &Value) -> Result<()>;

    /// Remove a field; `false` if it was not there.
    fn remove(&mut self, path: &FieldPath) -> bool;

    /// Whether `render` loses comments the parsed text carried.
    fn drops_comments(&self) -> bool {
        false
    }
}

/// What a generator wants at one field path.
#[derive(Debug, Clone, PartialEq)]
pub enum Desired {
    /// Managed: corrected whenever it differs
    Value(Value),
    /// Written only when absent; the user owns it afterwards
    Seed(Value),
    /// Managed: removed when present
    Absent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManagedField {
    pub path: FieldPath,
    pub desired: Desired,
}

impl ManagedField {
    pub fn value(path: FieldPath, value: impl Into<Value>) -> Self {
        Self {
            path,
            desired: Desired::Value(value.into()),
        }
    }

    pub fn seed(path: FieldPath, value: impl Into<Value>) -> Self {
        Self {
            path,
            desired: Desired::Seed(value.into()),
        }
    }

    pub fn absent(path: FieldPath) -> Self {
        Self {
            path,
            desired: Desired::Absent,
        }
    }

    pub fn is_managed(&self) -> bool {
        !matches!(self.desired, Desired::Seed(_))
    }

    /// Whether `doc` needs this field patched.
    fn is_stale<D: Document>(&self, doc: &D) -> bool {
        let current = doc.get(&self.path);
        match (&self.desired, current) {
            (Desired::Value(want), Some(have)) => *want != have,
            (Desired::Value(_), None) => true,
            (Desired::Seed(_), current) => current.is_none(),
            (Desired::Absent, current) => current.is_some(),
        }
    }

    fn apply<D: Document>(&self, doc: &mut D) -> Result<()> {
        match &self.desired {
            Desired::Value(value) | Desired::Seed(value) => doc.set(&self.path, value),
            Desired::Absent => {
                doc.remove(&self.path);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Manifest,
    Env,
    NativeConfig,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Manifest => write!(f, "manifest"),
            ArtifactKind::Env => write!(f, "env"),
            ArtifactKind::NativeConfig => write!(f, "native-config"),
        }
    }
}

/// Description of a file a generator owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedArtifact {
    /// Relative to the project directory
    pub path: PathBuf,
    pub kind: ArtifactKind,
    /// Field paths the generator may overwrite; everything else is user-owned
    pub managed_fields: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ArtifactAction {
    Created,
    Unchanged,
    Updated { fields: Vec<String> },
    Recreated { reason: String },
}

impl ArtifactAction {
    pub fn wrote(&self) -> bool {
        !matches!(self, ArtifactAction::Unchanged)
    }
}

impl fmt::Display for ArtifactAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactAction::Created => write!(f, "created"),
            ArtifactAction::Unchanged => write!(f, "unchanged"),
            ArtifactAction::Updated { fields } => write!(f, "updated ({})", fields.join(", ")),
            ArtifactAction::Recreated { reason } => write!(f, "recreated ({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactOutcome {
    pub artifact: GeneratedArtifact,
    pub action: ArtifactAction,
    /// Copy of the previous content, when one was taken
    pub backup: Option<PathBuf>,
    /// The update could not keep the user's comments
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub comments_dropped: bool,
}

impl ArtifactOutcome {
    /// Warning for the caller when user content may have been lost.
    pub fn warning(&self) -> Option<String> {
        match &self.action {
            ArtifactAction::Recreated { reason } => Some(format!(
                "{} could not be parsed ({}) and was recreated{}",
                self.artifact.path.display(),
                reason,
                self.backup
                    .as_ref()
                    .map(|b| format!("; previous content saved to {}", b.display()))
                    .unwrap_or_default()
            )),
            ArtifactAction::Updated { .. } if self.comments_dropped => Some(format!(
                "{} was updated but its comments could not be kept{}",
                self.artifact.path.display(),
                self.backup
                    .as_ref()
                    .map(|b| format!("; previous content saved to {}", b.display()))
                    .unwrap_or_default()
            )),
            _ => None,
        }
    }
}

/// Reconciles artifacts under one project directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    project_dir: PathBuf,
    backups: bool,
}

impl ArtifactWriter {
    pub fn new(project_dir: impl Into<PathBuf>, backups: bool) -> Self {
        Self {
            project_dir: project_dir.into(),
            backups,
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn reconcile<D: Document>(
        &self,
        rel_path: &Path,
        kind: ArtifactKind,
        fields: &[ManagedField],
    ) -> Result<ArtifactOutcome> {
        let path = self.project_dir.join(rel_path);
        let artifact = GeneratedArtifact {
            path: rel_path.to_path_buf(),
            kind,
            managed_fields: fields
                .iter()
                .filter(|f| f.is_managed())
                .map(|f| f.path.to_string())
                .collect(),
        };

        let existing = match fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(SynthError::artifact(&path, format!("cannot read: {}", e))),
        };

        let Some(text) = existing.filter(|t| !t.trim().is_empty()) else {
            self.write(&path, &build::<D>(fields)?)?;
            info!(path = %rel_path.display(), kind = %kind, "Created artifact");
            return Ok(ArtifactOutcome {
                artifact,
                action: ArtifactAction::Created,
                backup: None,
                comments_dropped: false,
            });
        };

        let mut doc = match D::parse(&text) {
            Ok(doc) => doc,
            Err(reason) => {
                let backup = self.backup(rel_path, &text)?;
                self.write(&path, &build::<D>(fields)?)?;
                warn!(path = %rel_path.display(), reason = %reason, "Recreated unparseable artifact");
                return Ok(ArtifactOutcome {
                    artifact,
                    action: ArtifactAction::Recreated { reason },
                    backup,
                    comments_dropped: false,
                });
            }
        };

        let stale: Vec<&ManagedField> = fields.iter().filter(|f| f.is_stale(&doc)).collect();
        if stale.is_empty() {
            debug!(path = %rel_path.display(), "Artifact up to date");
            return Ok(ArtifactOutcome {
                artifact,
                action: ArtifactAction::Unchanged,
                backup: None,
                comments_dropped: false,
            });
        }

        for field in &stale {
            field.apply(&mut doc)?;
        }
        let backup = self.backup(rel_path, &text)?;
        self.write(&path, &doc.render()?)?;

        let fields: Vec<String> = stale.iter().map(|f| f.path.to_string()).collect();
        let comments_dropped = doc.drops_comments();
        if comments_dropped {
            warn!(path = %rel_path.display(), "Comments could not be kept");
        }
        info!(path = %rel_path.display(), fields = ?fields, "Updated artifact");
        Ok(ArtifactOutcome {
            artifact,
            action: ArtifactAction::Updated { fields },
            backup,
            comments_dropped,
        })
    }

    /// Copy previous content to `.scanstack/backups/<name>.<hash>.bak`.
    /// The name is content-addressed, so repeated backups of the same
    /// content collapse into one file.
    fn backup(&self, rel_path: &Path, content: &str) -> Result<Option<PathBuf>> {
        if !self.backups {
            return Ok(None);
        }
        let name = rel_path
            .to_string_lossy()
            .replace(['/', '\\'], "_");
        let hash = {
            let mut hasher = DefaultHasher::new();
            content.hash(&mut hasher);
            hasher.finish()
        };
        let dir = self.project_dir.join(STATE_DIR).join(BACKUP_DIR);
        let backup = dir.join(format!("{}.{:016x}.bak", name, hash));
        if !backup.exists() {
            fs::create_dir_all(&dir)?;
            fs::write(&backup, content)?;
        }
        debug!(backup = %backup.display(), "Backed up artifact");
        Ok(Some(backup))
    }

    fn write(&self, path: &Path, content: &str) -> Result<()> {
        write_atomic(path, content)
            .map_err(|e| SynthError::artifact(path, format!("cannot write: {}", e)))
    }
}

/// Fresh document holding every field.
fn build<D: Document>(fields: &[ManagedField]) -> Result<String> {
    let mut doc = D::empty();
    for field in fields {
        field.apply(&mut doc)?;
    }
    doc.render()
}

/// Write to a sibling temp file and rename it into place.
pub fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    let temp = path.with_file_name(format!(".{}.tmp-{}", file_name, std::process::id()));
    fs::write(&temp, content)?;
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    Ok(())
}

/// Read one string field out of an existing artifact, if the file exists and
/// parses. Used to find credentials from previous runs.
pub fn read_string_field<D: Document>(path: &Path, field: &FieldPath) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let doc = D::parse(&text).ok()?;
    match doc.get(field)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
