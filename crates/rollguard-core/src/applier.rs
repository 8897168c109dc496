//! Change applier
//!
//! Backs up every target, runs the external transform over the target's
//! files, and commits if anything changed. Until a commit succeeds, any
//! failure restores the file snapshots immediately.

use crate::backup::{Backup, BackupStore, FileSnapshot, LiveSnapshot};
use crate::config::TargetSpec;
use crate::error::{Result, RollguardError};
use crate::phase::{PhaseOutcome, PhaseRecorder};
use crate::ports::{ConfigTransform, Repository, Workloads};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the applier did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Outcome recorded for the apply phase
    pub outcome: PhaseOutcome,
    /// Files that differ from their backup
    pub changed_files: Vec<PathBuf>,
    /// Commit id, if a commit was made
    pub commit_id: Option<String>,
    /// Failure description
    pub error: Option<String>,
}

impl ApplyReport {
    fn new(outcome: PhaseOutcome) -> Self {
        Self {
            outcome,
            changed_files: Vec::new(),
            commit_id: None,
            error: None,
        }
    }

    fn failed(error: &RollguardError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(PhaseOutcome::Fail)
        }
    }

    /// Whether the apply failed
    #[inline]
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.outcome == PhaseOutcome::Fail
    }
}

/// Change applier
pub struct ChangeApplier {
    repo: Arc<dyn Repository>,
    transform: Arc<dyn ConfigTransform>,
    workloads: Arc<dyn Workloads>,
    store: Arc<BackupStore>,
    recorder: PhaseRecorder,
    committed: Arc<AtomicBool>,
    dry_run: bool,
    commit_message: String,
}

impl ChangeApplier {
    /// Create new applier
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        repo: Arc<dyn Repository>,
        transform: Arc<dyn ConfigTransform>,
        workloads: Arc<dyn Workloads>,
        store: Arc<BackupStore>,
        recorder: PhaseRecorder,
        committed: Arc<AtomicBool>,
        dry_run: bool,
        commit_message: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            transform,
            workloads,
            store,
            recorder,
            committed,
            dry_run,
            commit_message: commit_message.into(),
        }
    }

    /// Back up, transform and commit. Records the `apply` and `commit` phases.
    pub async fn apply(&self, targets: &[Arc<TargetSpec>]) -> ApplyReport {
        if let Err(e) = self.back_up(targets).await {
            self.recorder.fail("apply", format!("backup failed: {e}"));
            self.recorder.skip("commit", "nothing applied");
            return ApplyReport::failed(&e);
        }

        if targets.iter().all(|t| t.files.is_empty()) {
            self.recorder.skip("apply", "no files configured");
            self.recorder.skip("commit", "nothing to commit");
            return ApplyReport::new(PhaseOutcome::Skip);
        }

        if let Err(e) = self.run_transform(targets).await {
            self.restore_now();
            self.recorder.fail("apply", format!("transform failed, backups restored: {e}"));
            self.recorder.skip("commit", "transform failed");
            return ApplyReport::failed(&e);
        }

        let changed = match self.changed_files(targets) {
            Ok(changed) => changed,
            Err(e) => {
                self.restore_now();
                self.recorder.fail("apply", format!("cannot diff against backup: {e}"));
                self.recorder.skip("commit", "diff failed");
                return ApplyReport::failed(&e);
            }
        };

        if changed.is_empty() {
            self.recorder.skip("apply", "transform produced no changes");
            self.recorder.skip("commit", "nothing to commit");
            return ApplyReport::new(PhaseOutcome::Skip);
        }

        if self.dry_run {
            self.restore_now();
            let listing: Vec<String> = changed.iter().map(|p| p.display().to_string()).collect();
            self.recorder.skip(
                "apply",
                format!("dry run, {} file(s) would change: {}", changed.len(), listing.join(", ")),
            );
            self.recorder.skip("commit", "dry run");
            return ApplyReport {
                changed_files: changed,
                ..ApplyReport::new(PhaseOutcome::Skip)
            };
        }

        self.recorder
            .ok("apply", format!("{} file(s) changed", changed.len()));

        match self.repo.commit(&changed, &self.commit_message).await {
            Ok(commit_id) => {
                self.committed.store(true, Ordering::SeqCst);
                self.store.retire_files();
                self.recorder.ok("commit", commit_id.clone());
                ApplyReport {
                    outcome: PhaseOutcome::Ok,
                    changed_files: changed,
                    commit_id: Some(commit_id),
                    error: None,
                }
            }
            Err(e) => {
                self.restore_now();
                self.recorder.fail("commit", format!("commit failed, backups restored: {e}"));
                ApplyReport {
                    changed_files: changed,
                    ..ApplyReport::failed(&e)
                }
            }
        }
    }

    /// Every target gets a backup, with its live snapshot, even when one of
    /// its files cannot be read; unreadable files are reported together.
    async fn back_up(&self, targets: &[Arc<TargetSpec>]) -> Result<()> {
        let mut errors = Vec::new();
        for target in targets {
            let live = self.capture_live(target).await;
            let mut files = Vec::with_capacity(target.files.len());
            for path in &target.files {
                match FileSnapshot::capture(path) {
                    Ok(snapshot) => {
                        debug!("Backed up {} ({})", path.display(), snapshot.digest);
                        files.push(snapshot);
                    }
                    Err(e) => {
                        warn!("Cannot back up {} for {}: {}", path.display(), target.name, e);
                        errors.push(e);
                    }
                }
            }
            self.store.insert(Backup::new(target.name.clone(), files, live));
        }
        info!("Backed up {} target(s)", targets.len());

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            n => {
                let listing: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Err(RollguardError::Apply(format!("{n} file(s) unreadable: {}", listing.join("; "))))
            }
        }
    }

    async fn capture_live(&self, target: &TargetSpec) -> Option<LiveSnapshot> {
        let manifest = match self.workloads.export_manifest(target).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("No live snapshot for {}: {}", target.name, e);
                return None;
            }
        };
        match self.workloads.status(target).await {
            Ok(status) => Some(LiveSnapshot {
                manifest,
                replicas: status.desired,
            }),
            Err(e) => {
                warn!("No replica count for {}: {}", target.name, e);
                None
            }
        }
    }

    async fn run_transform(&self, targets: &[Arc<TargetSpec>]) -> Result<()> {
        for target in targets {
            for path in &target.files {
                debug!("Transforming {}", path.display());
                self.transform.transform(path).await?;
            }
        }
        Ok(())
    }

    fn changed_files(&self, targets: &[Arc<TargetSpec>]) -> Result<Vec<PathBuf>> {
        let mut changed = Vec::new();
        for target in targets {
            if let Some(backup) = self.store.get(&target.name) {
                changed.extend(backup.changed_files()?);
            }
        }
        Ok(changed)
    }

    fn restore_now(&self) {
        if self.committed.load(Ordering::SeqCst) {
            return;
        }
        let summary = self.store.restore_outstanding();
        if summary.is_clean() {
            info!("Restored {} file(s) from backup", summary.files_restored);
        } else {
            warn!("Restore incomplete: {:?}", summary.failures);
        }
    }
}
