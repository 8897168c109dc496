//! Core types for rollguard
//!
//! Defines the fundamental types shared by every component:
//! - Run identifiers
//! - Reconciler sync/health status values
//! - Workload status and per-tick health samples
//! - Runtime target state and final status

use crate::config::TargetSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use ulid::Ulid;

/// Unique run identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reconciler sync status of a declarative object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Live state matches declared state
    Synced,
    /// Live state differs from declared state
    OutOfSync,
    /// Reconciler could not tell, or we could not read it
    Unknown,
}

impl FromStr for SyncStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "Synced" => Self::Synced,
            "OutOfSync" => Self::OutOfSync,
            _ => Self::Unknown,
        })
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Reconciler health status of a declarative object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    /// All resources healthy
    Healthy,
    /// At least one resource degraded
    Degraded,
    /// Resources still rolling out
    Progressing,
    /// Anything else (`Missing`, `Suspended`, unreadable)
    Unknown,
}

impl FromStr for HealthStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "Healthy" => Self::Healthy,
            "Degraded" => Self::Degraded,
            "Progressing" => Self::Progressing,
            _ => Self::Unknown,
        })
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Snapshot of the reconciler's view of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStatus {
    /// Sync status
    pub sync: SyncStatus,
    /// Health status
    pub health: HealthStatus,
}

impl AppStatus {
    /// Create new app status
    #[inline]
    #[must_use]
    pub fn new(sync: SyncStatus, health: HealthStatus) -> Self {
        Self { sync, health }
    }

    /// Status used when the reconciler cannot be read
    #[inline]
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(SyncStatus::Unknown, HealthStatus::Unknown)
    }

    /// `Synced` and `Healthy`
    #[inline]
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.sync == SyncStatus::Synced && self.health == HealthStatus::Healthy
    }
}

/// Pod phase of a workload, including container waiting reasons
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadPhase {
    /// Pods running
    Running,
    /// Pods scheduled but not started
    Pending,
    /// Pods completed
    Succeeded,
    /// Pods failed
    Failed,
    /// Container restarting in a loop
    CrashLoopBackOff,
    /// Container terminated with an error
    Error,
    /// Container killed for exceeding memory
    OOMKilled,
    /// No pods found for the workload
    Absent,
    /// Phase we do not classify
    Other(String),
}

impl WorkloadPhase {
    /// Phases that count as a crash for failure tracking
    #[inline]
    #[must_use]
    pub fn is_crash_like(&self) -> bool {
        matches!(self, Self::CrashLoopBackOff | Self::Error | Self::OOMKilled)
    }
}

impl FromStr for WorkloadPhase {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "Running" => Self::Running,
            "Pending" | "ContainerCreating" | "PodInitializing" => Self::Pending,
            "Succeeded" | "Completed" => Self::Succeeded,
            "Failed" => Self::Failed,
            "CrashLoopBackOff" => Self::CrashLoopBackOff,
            "Error" => Self::Error,
            "OOMKilled" => Self::OOMKilled,
            "" => Self::Absent,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(raw) => write!(f, "{raw}"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Workload orchestrator view of one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    /// Worst pod phase across the workload
    pub phase: WorkloadPhase,
    /// Ready replicas
    pub ready: u32,
    /// Desired replicas
    pub desired: u32,
    /// Highest container restart count
    pub restarts: u32,
}

impl WorkloadStatus {
    /// Status used when the workload cannot be read
    #[inline]
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            phase: WorkloadPhase::Other("Unknown".to_string()),
            ready: 0,
            desired: 0,
            restarts: 0,
        }
    }
}

/// One polled multi-signal health snapshot for a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSample {
    /// Reconciler sync status
    pub sync: SyncStatus,
    /// Reconciler health status
    pub health: HealthStatus,
    /// Worst pod phase
    pub phase: WorkloadPhase,
    /// Ready replicas
    pub ready_replicas: u32,
    /// Desired replicas
    pub desired_replicas: u32,
    /// Highest restart count
    pub restart_count: u32,
}

impl HealthSample {
    /// Combine reconciler and workload signals
    #[inline]
    #[must_use]
    pub fn from_signals(app: AppStatus, workload: WorkloadStatus) -> Self {
        Self {
            sync: app.sync,
            health: app.health,
            phase: workload.phase,
            ready_replicas: workload.ready,
            desired_replicas: workload.desired,
            restart_count: workload.restarts,
        }
    }

    /// `Synced` and `Healthy`; resets the failure counter
    #[inline]
    #[must_use]
    pub fn is_fully_healthy(&self) -> bool {
        self.sync == SyncStatus::Synced && self.health == HealthStatus::Healthy
    }

    /// Crash-like phase or restart count above `restart_threshold`
    #[inline]
    #[must_use]
    pub fn is_failure(&self, restart_threshold: u32) -> bool {
        self.phase.is_crash_like() || self.restart_count > restart_threshold
    }
}

/// Final status of a target at the end of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Converged and passed secondary checks
    Success,
    /// Sustained failure, backup re-applied
    RolledBack,
    /// Neither converged nor failed inside the window
    Timeout,
    /// Not determined (interrupted, rollback impossible, task lost)
    Unknown,
}

impl TargetStatus {
    /// Lowercase label used in reports
    #[inline]
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RolledBack => "rolled_back",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A named remediable unit, owned by exactly one task at a time
#[derive(Debug, Clone)]
pub struct Target {
    /// Static configuration
    pub spec: Arc<TargetSpec>,
    /// Backup reference, if one was captured
    pub backup: Option<Arc<crate::backup::Backup>>,
    /// Consecutive failed samples
    pub consecutive_failures: u32,
    /// Set once the failure threshold is crossed
    pub rollback_needed: bool,
    /// Final status
    pub status: TargetStatus,
}

impl Target {
    /// Create new target from its spec
    #[inline]
    #[must_use]
    pub fn new(spec: Arc<TargetSpec>) -> Self {
        Self {
            spec,
            backup: None,
            consecutive_failures: 0,
            rollback_needed: false,
            status: TargetStatus::Unknown,
        }
    }

    /// Target name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// With backup
    #[inline]
    #[must_use]
    pub fn with_backup(mut self, backup: Option<Arc<crate::backup::Backup>>) -> Self {
        self.backup = backup;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sync: SyncStatus, health: HealthStatus, phase: WorkloadPhase, restarts: u32) -> HealthSample {
        HealthSample {
            sync,
            health,
            phase,
            ready_replicas: 1,
            desired_replicas: 1,
            restart_count: restarts,
        }
    }

    #[test]
    fn status_parsing_maps_unlisted_values_to_unknown() {
        assert_eq!("Synced".parse::<SyncStatus>().unwrap(), SyncStatus::Synced);
        assert_eq!("OutOfSync".parse::<SyncStatus>().unwrap(), SyncStatus::OutOfSync);
        assert_eq!("".parse::<SyncStatus>().unwrap(), SyncStatus::Unknown);
        assert_eq!("Missing".parse::<HealthStatus>().unwrap(), HealthStatus::Unknown);
        assert_eq!("Suspended".parse::<HealthStatus>().unwrap(), HealthStatus::Unknown);
        assert_eq!("Progressing".parse::<HealthStatus>().unwrap(), HealthStatus::Progressing);
    }

    #[test]
    fn workload_phase_crash_set() {
        assert!(WorkloadPhase::CrashLoopBackOff.is_crash_like());
        assert!(WorkloadPhase::Error.is_crash_like());
        assert!(WorkloadPhase::OOMKilled.is_crash_like());
        assert!(!WorkloadPhase::Running.is_crash_like());
        assert!(!WorkloadPhase::Pending.is_crash_like());
        assert_eq!(
            "ImagePullBackOff".parse::<WorkloadPhase>().unwrap(),
            WorkloadPhase::Other("ImagePullBackOff".to_string())
        );
    }

    #[test]
    fn sample_failure_uses_restart_threshold() {
        let s = sample(SyncStatus::Synced, HealthStatus::Degraded, WorkloadPhase::Running, 5);
        assert!(!s.is_failure(5));
        let s = sample(SyncStatus::Synced, HealthStatus::Degraded, WorkloadPhase::Running, 6);
        assert!(s.is_failure(5));
        let s = sample(SyncStatus::OutOfSync, HealthStatus::Degraded, WorkloadPhase::CrashLoopBackOff, 0);
        assert!(s.is_failure(5));
    }

    #[test]
    fn sample_fully_healthy_ignores_workload() {
        let s = sample(SyncStatus::Synced, HealthStatus::Healthy, WorkloadPhase::Pending, 0);
        assert!(s.is_fully_healthy());
        let s = sample(SyncStatus::Synced, HealthStatus::Progressing, WorkloadPhase::Running, 0);
        assert!(!s.is_fully_healthy());
    }

    #[test]
    fn target_status_labels() {
        assert_eq!(TargetStatus::RolledBack.to_string(), "rolled_back");
        assert_eq!(
            serde_json::to_string(&TargetStatus::RolledBack).unwrap(),
            "\"rolled_back\""
        );
    }
}
