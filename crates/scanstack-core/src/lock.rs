//! Directory lock: one synthesis run per project directory.
//!
//! The lock is a JSON file created with `create_new`, so two runs racing for
//! it cannot both win. A lock whose holder is gone, or which is older than
//! `lock_stale_secs`, is recovered with a warning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use crate::error::{Result, SynthError};
use crate::STATE_DIR;

pub const LOCK_FILE: &str = "synth.lock";

/// Lock file contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub hostname: String,
    /// Step the holder was in
    pub step: String,
}

impl LockInfo {
    fn new(step: &str) -> Self {
        Self {
            pid: process::id(),
            acquired_at: Utc::now(),
            hostname: local_hostname(),
            step: step.to_string(),
        }
    }

    pub fn age_secs(&self) -> u64 {
        (Utc::now() - self.acquired_at).num_seconds().max(0) as u64
    }

    /// Liveness can only be checked for holders on this machine; a holder
    /// elsewhere is assumed alive until the lock goes stale.
    fn process_exists(&self) -> bool {
        if self.hostname != local_hostname() {
            return true;
        }
        let pid = Pid::from_u32(self.pid);
        let mut sys = System::new();
        sys.refresh_process(pid) && sys.process(pid).is_some()
    }

    fn describe(&self) -> String {
        format!(
            "pid {} on {} since {}s ago, step {}",
            self.pid,
            self.hostname,
            self.age_secs(),
            self.step
        )
    }
}

fn local_hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Held for the duration of a run; released on drop.
#[derive(Debug)]
pub struct SynthLock {
    path: PathBuf,
    info: LockInfo,
    recovered: Option<String>,
}

impl SynthLock {
    pub fn acquire(project_dir: &Path, step: &str, stale_secs: u64) -> Result<Self> {
        let dir = project_dir.join(STATE_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOCK_FILE);
        let info = LockInfo::new(step);

        let mut recovered = None;
        // Second pass only after removing a stale or dead lock
        for _ in 0..2 {
            match Self::create(&path, &info) {
                Ok(()) => {
                    info!(path = %path.display(), step = step, "Acquired project lock");
                    return Ok(Self {
                        path,
                        info,
                        recovered,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    recovered = Some(Self::recover(&path, stale_secs)?);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let holder = read_holder(&path)
            .map(|h| h.describe())
            .unwrap_or_else(|| "another run".to_string());
        Err(SynthError::Locked { holder })
    }

    fn create(path: &Path, info: &LockInfo) -> io::Result<()> {
        let content = serde_json::to_string_pretty(info)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()
    }

    /// Remove a lock that no longer protects anything, or report its holder.
    fn recover(path: &Path, stale_secs: u64) -> Result<String> {
        let message = match read_holder(path) {
            Some(holder) if holder.age_secs() > stale_secs => {
                format!("recovered stale project lock ({})", holder.describe())
            }
            Some(holder) if !holder.process_exists() => {
                format!("recovered project lock of exited process ({})", holder.describe())
            }
            Some(holder) => {
                return Err(SynthError::Locked {
                    holder: holder.describe(),
                })
            }
            None => "recovered unreadable project lock".to_string(),
        };
        warn!("{}", message);
        match fs::remove_file(path) {
            Ok(()) => Ok(message),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(message),
            Err(e) => Err(e.into()),
        }
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Warning produced when a leftover lock was taken over.
    pub fn take_warning(&mut self) -> Option<String> {
        self.recovered.take()
    }

    /// Record the current step in the lock file.
    pub fn update_step(&mut self, step: &str) -> Result<()> {
        self.info.step = step.to_string();
        let content = serde_json::to_string_pretty(&self.info)?;
        crate::artifact::write_atomic(&self.path, &content)?;
        debug!(step = step, "Lock step updated");
        Ok(())
    }
}

fn read_holder(path: &Path) -> Option<LockInfo> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

impl Drop for SynthLock {
    fn drop(&mut self) {
        // Only remove the file if it is still ours
        let ours = read_holder(&self.path).is_some_and(|h| h.pid == self.info.pid);
        if !ours {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Released project lock"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Could not release project lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_refused_while_held() {
        let dir = TempDir::new().unwrap();
        let lock = SynthLock::acquire(dir.path(), "artifacts", 3600).unwrap();
        let err = SynthLock::acquire(dir.path(), "artifacts", 3600).unwrap_err();
        assert!(matches!(err, SynthError::Locked { .. }));
        assert_eq!(err.exit_code(), 75);

        drop(lock);
        assert!(!dir.path().join(STATE_DIR).join(LOCK_FILE).exists());
        assert!(SynthLock::acquire(dir.path(), "artifacts", 3600).is_ok());
    }

    #[test]
    fn test_stale_lock_is_recovered_with_warning() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join(STATE_DIR);
        fs::create_dir_all(&state).unwrap();
        let mut old = LockInfo::new("deps");
        old.acquired_at = Utc::now() - Duration::hours(3);
        fs::write(state.join(LOCK_FILE), serde_json::to_string(&old).unwrap()).unwrap();

        let mut lock = SynthLock::acquire(dir.path(), "resolve", 3600).unwrap();
        assert!(lock.take_warning().unwrap().contains("stale"));
        assert_eq!(lock.info().step, "resolve");
    }

    #[test]
    fn test_garbage_lock_is_recovered() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join(STATE_DIR);
        fs::create_dir_all(&state).unwrap();
        fs::write(state.join(LOCK_FILE), "not json").unwrap();

        let mut lock = SynthLock::acquire(dir.path(), "resolve", 3600).unwrap();
        assert!(lock.take_warning().is_some());
    }
}
