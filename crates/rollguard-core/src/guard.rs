//! Guaranteed cleanup for a run
//!
//! The [`RunGuard`] is created before the first phase. [`RunGuard::finish`]
//! restores outstanding backups unless the change was committed, revokes
//! any tokens minted during the run, and assembles the [`RunReport`]. If the
//! guard is dropped without `finish` (panic, aborted future) the restore
//! still happens in `Drop`.

use crate::auth::SessionCell;
use crate::backup::BackupStore;
use crate::phase::{Classification, PhaseOutcome, PhaseRecorder, RunReport, TargetReport};
use crate::ports::AuthClient;
use crate::types::RunId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const REVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// State shared between the pipeline and its guard
#[derive(Debug)]
pub struct RunState {
    /// Run id
    pub run_id: RunId,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Phase log
    pub recorder: PhaseRecorder,
    /// Backups
    pub store: Arc<BackupStore>,
    /// Set once the change is committed
    pub committed: Arc<AtomicBool>,
    /// Whether this is a dry run
    pub dry_run: bool,
    session: Mutex<Option<Arc<SessionCell>>>,
}

impl RunState {
    /// Create new run state; backups mirror under `backup_root`
    #[must_use]
    pub fn new(run_id: RunId, backup_root: PathBuf, dry_run: bool) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            recorder: PhaseRecorder::new(),
            store: Arc::new(BackupStore::new(backup_root)),
            committed: Arc::new(AtomicBool::new(false)),
            dry_run,
            session: Mutex::new(None),
        }
    }

    /// Register the session cell so minted tokens can be torn down
    pub fn set_session(&self, cell: Arc<SessionCell>) {
        *self.session.lock() = Some(cell);
    }

    /// Whether the change was committed
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    fn minted_tokens(&self) -> Vec<String> {
        self.session
            .lock()
            .as_ref()
            .map(|cell| cell.take_minted())
            .unwrap_or_default()
    }
}

/// Cleanup hook for one run
pub struct RunGuard {
    state: Arc<RunState>,
    auth: Arc<dyn AuthClient>,
    token_account: String,
    log_file: Option<PathBuf>,
    finished: AtomicBool,
}

impl RunGuard {
    /// Register the guard for `state`
    #[must_use]
    pub fn new(
        state: Arc<RunState>,
        auth: Arc<dyn AuthClient>,
        token_account: impl Into<String>,
        log_file: Option<PathBuf>,
    ) -> Self {
        Self {
            state,
            auth,
            token_account: token_account.into(),
            log_file,
            finished: AtomicBool::new(false),
        }
    }

    /// Shared run state
    #[must_use]
    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    /// Run cleanup and build the report
    pub async fn finish(self, targets: Vec<TargetReport>) -> RunReport {
        self.finished.store(true, Ordering::SeqCst);
        self.restore();
        self.revoke_tokens().await;

        let phases = self.state.recorder.snapshot();
        let classification = if self.state.dry_run {
            if phases.iter().any(|p| p.outcome == PhaseOutcome::Fail) {
                Classification::NeedsAttention
            } else {
                Classification::Converged
            }
        } else {
            Classification::of(&targets)
        };
        info!("Run {} finished: {}", self.state.run_id, classification);

        RunReport {
            run_id: self.state.run_id,
            started_at: self.state.started_at,
            finished_at: Utc::now(),
            phases,
            targets,
            classification,
            dry_run: self.state.dry_run,
            log_file: self.log_file.clone(),
        }
    }

    fn restore(&self) {
        let recorder = &self.state.recorder;
        if self.state.is_committed() {
            recorder.skip("cleanup:restore", "changes committed");
            return;
        }
        let summary = self.state.store.restore_outstanding();
        if !summary.is_clean() {
            let failed: Vec<&str> = summary.failures.iter().map(|(t, _)| t.as_str()).collect();
            recorder.fail(
                "cleanup:restore",
                format!("could not restore {}", failed.join(", ")),
            );
        } else if summary.files_restored > 0 {
            recorder.ok(
                "cleanup:restore",
                format!("restored {} file(s)", summary.files_restored),
            );
        } else {
            recorder.skip("cleanup:restore", "nothing outstanding");
        }
    }

    async fn revoke_tokens(&self) {
        let tokens = self.state.minted_tokens();
        if tokens.is_empty() {
            return;
        }
        let mut failed = Vec::new();
        for id in &tokens {
            let revoke = self.auth.revoke_token(&self.token_account, id);
            match tokio::time::timeout(REVOKE_TIMEOUT, revoke).await {
                Ok(Ok(())) => info!("Revoked minted token {}", id),
                Ok(Err(e)) => {
                    warn!("Could not revoke token {}: {}", id, e);
                    failed.push(id.clone());
                }
                Err(_) => {
                    warn!("Revoking token {} timed out", id);
                    failed.push(id.clone());
                }
            }
        }
        if failed.is_empty() {
            self.state
                .recorder
                .ok("cleanup:credentials", format!("revoked {} token(s)", tokens.len()));
        } else {
            self.state
                .recorder
                .warn("cleanup:credentials", format!("left unrevoked: {}", failed.join(", ")));
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("Run {} ended without cleanup; restoring backups", self.state.run_id);
        self.restore();
        let tokens = self.state.minted_tokens();
        if !tokens.is_empty() {
            warn!("Minted tokens left unrevoked: {}", tokens.join(", "));
        }
    }
}
