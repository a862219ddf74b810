use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Session-wide record of block names already emitted.
///
/// Every operation takes the same lock, so [`InclusionTracker::mark_seen`]
/// is an atomic check-then-insert and concurrent resolve calls can never
/// both include the same block.
#[derive(Debug, Default)]
pub struct InclusionTracker {
    seen: Mutex<HashSet<String>>,
}

impl InclusionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            seen: Mutex::new(snapshot.seen.into_iter().collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked: inserts are atomic.
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `name` as emitted. Returns `false` if it was already seen.
    pub fn mark_seen(&self, name: &str) -> bool {
        let mut seen = self.lock();
        if seen.contains(name) {
            return false;
        }
        seen.insert(name.to_string())
    }

    pub fn is_seen(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    /// Claim a batch under one lock acquisition; `result[i]` tells whether `names[i]` was newly claimed
    pub fn claim_all<'a, I>(&self, names: I) -> Vec<bool>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = self.lock();
        names
            .into_iter()
            .map(|name| !seen.contains(name) && seen.insert(name.to_string()))
            .collect()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut seen: Vec<String> = self.lock().iter().cloned().collect();
        seen.sort();
        SessionSnapshot {
            schema_version: SESSION_SCHEMA_VERSION,
            seen,
        }
    }
}

pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Persisted form of a tracker, so a session can span processes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub seen: Vec<String>,
}

fn default_schema_version() -> u32 {
    SESSION_SCHEMA_VERSION
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            seen: Vec::new(),
        }
    }
}

impl SessionSnapshot {
    /// Read a snapshot; a missing file is an empty session
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read session file {}", path.display()))?;
        let snapshot: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("Session file {} is not valid JSON", path.display()))?;
        if snapshot.schema_version != SESSION_SCHEMA_VERSION {
            anyhow::bail!(
                "session schema_version {} is not supported (expected {SESSION_SCHEMA_VERSION})",
                snapshot.schema_version
            );
        }
        Ok(snapshot)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace session file {}", path.display()))?;
        Ok(())
    }
}

/// Exclusive advisory lock on `<session>.lock`, held across load, resolve
/// and save so processes sharing a session file take turns. Released on drop.
#[derive(Debug)]
pub struct SessionLock {
    file: File,
    path: PathBuf,
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl SessionLock {
    pub fn lock_path(session: &Path) -> PathBuf {
        let mut name = session.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Waits until no other holder remains
    pub async fn acquire(session: &Path) -> Result<Self> {
        let path = Self::lock_path(session);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        tokio::task::spawn_blocking(move || -> Result<Self> {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .with_context(|| format!("Failed to open session lock {}", path.display()))?;
            FileExt::lock_exclusive(&file)
                .with_context(|| format!("Failed to acquire session lock {}", path.display()))?;
            log::debug!("Acquired session lock {}", path.display());
            Ok(Self { file, path })
        })
        .await
        .context("Session lock task failed")?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mark_seen_is_once_only() {
        let tracker = InclusionTracker::new();
        assert!(tracker.mark_seen("core"));
        assert!(!tracker.mark_seen("core"));
        assert!(tracker.is_seen("core"));
        assert_eq!(tracker.len(), 1);

        tracker.reset();
        assert!(!tracker.is_seen("core"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn claim_all_rejects_duplicates_within_batch() {
        let tracker = InclusionTracker::new();
        tracker.mark_seen("a");
        let claimed = tracker.claim_all(["a", "b", "b", "c"]);
        assert_eq!(claimed, vec![false, true, false, true]);
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/session.json");

        assert_eq!(SessionSnapshot::load(&path).unwrap(), SessionSnapshot::default());

        let tracker = InclusionTracker::new();
        tracker.mark_seen("style");
        tracker.mark_seen("mission");
        tracker.snapshot().save(&path).unwrap();

        let restored = InclusionTracker::from_snapshot(SessionSnapshot::load(&path).unwrap());
        assert!(restored.is_seen("style"));
        assert!(restored.is_seen("mission"));
        assert_eq!(restored.snapshot().seen, vec!["mission", "style"]);
    }

    #[tokio::test]
    async fn session_lock_excludes_other_holders_until_dropped() {
        let dir = tempdir().unwrap();
        let session = dir.path().join("state/session.json");

        let lock = SessionLock::acquire(&session).await.unwrap();
        assert_eq!(lock.path(), dir.path().join("state/session.json.lock"));

        let other = File::open(lock.path()).unwrap();
        assert!(FileExt::try_lock_exclusive(&other).is_err());

        drop(lock);
        FileExt::try_lock_exclusive(&other).unwrap();
        FileExt::unlock(&other).unwrap();
    }

    #[test]
    fn rejects_unknown_schema_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"schema_version": 7, "seen": []}"#).unwrap();
        let err = SessionSnapshot::load(&path).unwrap_err();
        assert!(err.to_string().contains("schema_version 7"));
    }
}
