//! Rollback engine
//!
//! Restores a target from its backup's live snapshot: scale to zero, wait
//! for the settle delay, re-apply the captured manifest, scale back to the
//! captured replica count. Each step goes through the retry combinator.

use crate::backup::Backup;
use crate::config::TargetSpec;
use crate::error::{Result, RollguardError};
use crate::ports::Workloads;
use crate::retry::{with_backoff, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Rollback engine
pub struct RollbackEngine {
    workloads: Arc<dyn Workloads>,
    retry: RetryPolicy,
    settle_delay: Duration,
}

impl RollbackEngine {
    /// Create new engine
    #[must_use]
    pub fn new(workloads: Arc<dyn Workloads>, retry: RetryPolicy, settle_delay: Duration) -> Self {
        Self {
            workloads,
            retry,
            settle_delay,
        }
    }

    /// Roll `target` back to `backup`
    ///
    /// # Errors
    /// `RollguardError::RollbackImpossible` when there is no backup or it has no
    /// live snapshot; otherwise the error of the step that failed.
    pub async fn rollback(&self, target: &TargetSpec, backup: Option<&Backup>) -> Result<()> {
        let impossible = || RollguardError::RollbackImpossible {
            target: target.name.clone(),
        };
        let backup = backup.ok_or_else(impossible)?;
        let live = backup.live.as_ref().ok_or_else(impossible)?;
        let workload = target.workload_ref();
        warn!("Rolling back {} ({})", target.name, workload);

        with_backoff(&self.retry, &format!("scale {workload} to 0"), || {
            self.workloads.scale(target, 0)
        })
        .await?;

        tokio::time::sleep(self.settle_delay).await;

        with_backoff(&self.retry, &format!("re-apply {workload}"), || {
            self.workloads.apply_manifest(target, &live.manifest)
        })
        .await?;

        with_backoff(
            &self.retry,
            &format!("scale {workload} to {}", live.replicas),
            || self.workloads.scale(target, live.replicas),
        )
        .await?;

        info!(
            "Rolled back {} to snapshot from {} ({} replicas)",
            target.name,
            backup.taken_at.to_rfc3339(),
            live.replicas
        );
        Ok(())
    }
}
