//! Backups of target configuration
//!
//! A [`Backup`] holds two parts:
//! - the file snapshot: verbatim bytes of every repository file the
//!   applier mutates, restorable until the change is committed
//! - the live snapshot: the workload's exported manifest and replica
//!   count, re-applied by the rollback engine
//!
//! File snapshots are mirrored under `<backup_dir>/<run_id>/<target>/` and the
//! mirror is removed when the snapshot is retired.

use crate::error::{Result, RollguardError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hex SHA-256 of `bytes`
#[must_use]
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Verbatim copy of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    /// Path the bytes were read from
    pub path: PathBuf,
    /// File contents
    pub contents: Vec<u8>,
    /// SHA-256 of `contents`
    pub digest: String,
}

impl FileSnapshot {
    /// Read `path` into a snapshot
    pub fn capture(path: &Path) -> Result<Self> {
        let contents = std::fs::read(path).map_err(|e| RollguardError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            digest: digest(&contents),
            contents,
        })
    }

    /// Whether the file on disk still matches the snapshot
    pub fn matches_disk(&self) -> Result<bool> {
        let current = std::fs::read(&self.path).map_err(|e| RollguardError::io(&self.path, e))?;
        Ok(digest(&current) == self.digest)
    }

    /// Write the snapshot back and verify the digest
    pub fn restore(&self) -> Result<()> {
        std::fs::write(&self.path, &self.contents).map_err(|e| RollguardError::io(&self.path, e))?;
        if !self.matches_disk()? {
            return Err(RollguardError::Apply(format!(
                "restored {} but digest differs from {}",
                self.path.display(),
                self.digest
            )));
        }
        Ok(())
    }
}

/// Live declarative state of a workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSnapshot {
    /// Sanitised exported manifest
    pub manifest: String,
    /// Replica count at capture time
    pub replicas: u32,
}

/// Immutable snapshot of one target's prior configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    /// Target name
    pub target: String,
    /// Repository file snapshots (empty once retired)
    pub files: Vec<FileSnapshot>,
    /// Live workload snapshot
    pub live: Option<LiveSnapshot>,
    /// Capture time
    pub taken_at: DateTime<Utc>,
}

impl Backup {
    /// Create new backup
    #[must_use]
    pub fn new(target: impl Into<String>, files: Vec<FileSnapshot>, live: Option<LiveSnapshot>) -> Self {
        Self {
            target: target.into(),
            files,
            live,
            taken_at: Utc::now(),
        }
    }

    /// Whether restorable file snapshots remain
    #[inline]
    #[must_use]
    pub fn has_files(&self) -> bool {
        !self.files.is_empty()
    }

    /// Copy with the file snapshot retired
    #[must_use]
    pub fn without_files(&self) -> Self {
        Self {
            target: self.target.clone(),
            files: Vec::new(),
            live: self.live.clone(),
            taken_at: self.taken_at,
        }
    }

    /// Files whose on-disk bytes differ from the snapshot
    pub fn changed_files(&self) -> Result<Vec<PathBuf>> {
        let mut changed = Vec::new();
        for file in &self.files {
            if !file.matches_disk()? {
                changed.push(file.path.clone());
            }
        }
        Ok(changed)
    }

    /// Write every file snapshot back
    pub fn restore_files(&self) -> Result<usize> {
        for file in &self.files {
            file.restore()?;
            debug!("Restored {} ({})", file.path.display(), file.digest);
        }
        Ok(self.files.len())
    }
}

/// Result of restoring all outstanding backups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Files written back
    pub files_restored: usize,
    /// Targets that could not be restored, with the reason
    pub failures: Vec<(String, String)>,
}

impl RestoreSummary {
    /// Whether every restore succeeded
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run-scoped owner of every target's backup
#[derive(Debug)]
pub struct BackupStore {
    root: PathBuf,
    backups: Mutex<BTreeMap<String, Arc<Backup>>>,
}

impl BackupStore {
    /// Create a store mirroring into `root` (normally `<backup_dir>/<run_id>`)
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backups: Mutex::new(BTreeMap::new()),
        }
    }

    /// Mirror directory for `target`
    #[must_use]
    pub fn mirror_dir(&self, target: &str) -> PathBuf {
        self.root.join(target)
    }

    /// Store `backup`, replacing any earlier one for the same target
    pub fn insert(&self, backup: Backup) -> Arc<Backup> {
        if let Err(e) = self.write_mirror(&backup) {
            warn!("Could not mirror backup for {}: {}", backup.target, e);
        }
        let backup = Arc::new(backup);
        let replaced = self
            .backups
            .lock()
            .insert(backup.target.clone(), Arc::clone(&backup));
        if replaced.is_some() {
            debug!("Replaced earlier backup for {}", backup.target);
        }
        backup
    }

    /// Backup for `target`
    #[must_use]
    pub fn get(&self, target: &str) -> Option<Arc<Backup>> {
        self.backups.lock().get(target).cloned()
    }

    /// Number of backups held
    #[must_use]
    pub fn len(&self) -> usize {
        self.backups.lock().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backups.lock().is_empty()
    }

    /// Restore every backup that still has file snapshots
    pub fn restore_outstanding(&self) -> RestoreSummary {
        let backups: Vec<Arc<Backup>> = self.backups.lock().values().cloned().collect();
        let mut summary = RestoreSummary::default();
        for backup in backups.iter().filter(|b| b.has_files()) {
            match backup.restore_files() {
                Ok(n) => summary.files_restored += n,
                Err(e) => {
                    warn!("Restore failed for {}: {}", backup.target, e);
                    summary.failures.push((backup.target.clone(), e.to_string()));
                }
            }
        }
        summary
    }

    /// Retire every file snapshot after a successful commit
    pub fn retire_files(&self) -> usize {
        let mut backups = self.backups.lock();
        let mut retired = 0;
        for backup in backups.values_mut() {
            if !backup.has_files() {
                continue;
            }
            retired += backup.files.len();
            *backup = Arc::new(backup.without_files());
            let dir = self.root.join(&backup.target);
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove backup mirror {}: {}", dir.display(), e);
                }
            }
        }
        if retired > 0 {
            info!("Retired {} file snapshots after commit", retired);
        }
        retired
    }

    fn write_mirror(&self, backup: &Backup) -> Result<()> {
        if !backup.has_files() {
            return Ok(());
        }
        let dir = self.mirror_dir(&backup.target);
        for file in &backup.files {
            let dest = dir.join(mirror_relative(&file.path));
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RollguardError::io(parent, e))?;
            }
            std::fs::write(&dest, &file.contents).map_err(|e| RollguardError::io(&dest, e))?;
        }
        Ok(())
    }
}

/// Path under the mirror directory: the file path with root and `..` removed
fn mirror_relative(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn snapshot_detects_change_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "values.yaml", "tls: false\n");
        let snap = FileSnapshot::capture(&path).unwrap();
        assert!(snap.matches_disk().unwrap());

        std::fs::write(&path, "tls: true\n").unwrap();
        assert!(!snap.matches_disk().unwrap());

        snap.restore().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "tls: false\n");
    }

    #[test]
    fn store_mirrors_and_retires() {
        let work = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        let path = write(work.path(), "values.yaml", "a: 1\n");
        let store = BackupStore::new(mirror.path().join("run"));

        let backup = Backup::new(
            "grafana",
            vec![FileSnapshot::capture(&path).unwrap()],
            Some(LiveSnapshot {
                manifest: "kind: Deployment\n".to_string(),
                replicas: 2,
            }),
        );
        store.insert(backup);
        let mirrored = store.mirror_dir("grafana").join(mirror_relative(&path));
        assert_eq!(std::fs::read_to_string(&mirrored).unwrap(), "a: 1\n");

        assert_eq!(store.retire_files(), 1);
        let kept = store.get("grafana").unwrap();
        assert!(!kept.has_files());
        assert_eq!(kept.live.as_ref().unwrap().replicas, 2);
        assert!(!store.mirror_dir("grafana").exists());

        std::fs::write(&path, "a: 2\n").unwrap();
        assert_eq!(store.restore_outstanding().files_restored, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a: 2\n");
    }

    #[test]
    fn at_most_one_backup_per_target() {
        let mirror = tempfile::tempdir().unwrap();
        let store = BackupStore::new(mirror.path());
        store.insert(Backup::new("a", Vec::new(), None));
        store.insert(Backup::new("a", Vec::new(), None));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn restore_reports_missing_parent() {
        let work = tempfile::tempdir().unwrap();
        let path = write(work.path(), "x.yaml", "x");
        let snap = FileSnapshot::capture(&path).unwrap();
        let store = BackupStore::new(work.path().join("mirror"));
        store.insert(Backup::new("t", vec![snap], None));
        drop(work);

        let summary = store.restore_outstanding();
        assert!(!summary.is_clean());
        assert_eq!(summary.failures[0].0, "t");
    }
}
