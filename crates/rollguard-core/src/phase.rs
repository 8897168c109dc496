//! Phase recording and the final run report

use crate::types::{RunId, TargetStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseOutcome {
    /// Completed
    Ok,
    /// Completed with something the operator should look at
    Warn,
    /// Failed
    Fail,
    /// Not run
    Skip,
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Skip => "skip",
        })
    }
}

/// One entry of the phase log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Phase name
    pub name: String,
    /// Outcome
    pub outcome: PhaseOutcome,
    /// Short detail
    pub detail: Option<String>,
    /// When the phase was recorded
    pub at: DateTime<Utc>,
}

/// Append-only phase log shared by the pipeline and the cleanup guard
#[derive(Debug, Clone, Default)]
pub struct PhaseRecorder {
    records: Arc<Mutex<Vec<PhaseRecord>>>,
}

impl PhaseRecorder {
    /// Create new recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a phase record
    pub fn record(&self, name: impl Into<String>, outcome: PhaseOutcome, detail: Option<String>) {
        let record = PhaseRecord {
            name: name.into(),
            outcome,
            detail,
            at: Utc::now(),
        };
        let detail = record.detail.as_deref().unwrap_or("");
        match outcome {
            PhaseOutcome::Fail => error!("Phase {}: {} {}", record.name, outcome, detail),
            PhaseOutcome::Warn => warn!("Phase {}: {} {}", record.name, outcome, detail),
            _ => info!("Phase {}: {} {}", record.name, outcome, detail),
        }
        self.records.lock().push(record);
    }

    /// Record `ok`
    pub fn ok(&self, name: impl Into<String>, detail: impl Into<String>) {
        self.record(name, PhaseOutcome::Ok, Some(detail.into()));
    }

    /// Record `warn`
    pub fn warn(&self, name: impl Into<String>, detail: impl Into<String>) {
        self.record(name, PhaseOutcome::Warn, Some(detail.into()));
    }

    /// Record `fail`
    pub fn fail(&self, name: impl Into<String>, detail: impl Into<String>) {
        self.record(name, PhaseOutcome::Fail, Some(detail.into()));
    }

    /// Record `skip`
    pub fn skip(&self, name: impl Into<String>, detail: impl Into<String>) {
        self.record(name, PhaseOutcome::Skip, Some(detail.into()));
    }

    /// Copy of the log so far, in order
    #[must_use]
    pub fn snapshot(&self) -> Vec<PhaseRecord> {
        self.records.lock().clone()
    }

    /// Outcome of the last record named `name`
    #[must_use]
    pub fn outcome_of(&self, name: &str) -> Option<PhaseOutcome> {
        self.records
            .lock()
            .iter()
            .rev()
            .find(|r| r.name == name)
            .map(|r| r.outcome)
    }
}

/// Final result for one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    /// Target name
    pub name: String,
    /// Final status
    pub status: TargetStatus,
    /// Health samples taken
    pub samples: u32,
    /// Consecutive failures at the end of monitoring
    pub consecutive_failures: u32,
    /// Whether the rollback engine ran
    pub rollback_invoked: bool,
    /// Seconds spent monitoring
    pub elapsed_secs: u64,
    /// Error attached to the target, if any
    pub error: Option<String>,
}

impl TargetReport {
    /// Report for a target whose outcome is not known
    #[must_use]
    pub fn unknown(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TargetStatus::Unknown,
            samples: 0,
            consecutive_failures: 0,
            rollback_invoked: false,
            elapsed_secs: 0,
            error: Some(error.into()),
        }
    }
}

/// Overall classification of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Every target converged
    Converged,
    /// Partial success or unresolved timeouts; check manually
    NeedsAttention,
    /// At least one target was rolled back
    RolledBack,
}

impl Classification {
    /// Classify target outcomes
    #[must_use]
    pub fn of(targets: &[TargetReport]) -> Self {
        if targets.iter().any(|t| t.status == TargetStatus::RolledBack) {
            Self::RolledBack
        } else if !targets.is_empty() && targets.iter().all(|t| t.status == TargetStatus::Success) {
            Self::Converged
        } else {
            Self::NeedsAttention
        }
    }

    /// Process exit code
    #[inline]
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Converged => 0,
            Self::NeedsAttention => 1,
            Self::RolledBack => 2,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Converged => "all targets converged",
            Self::NeedsAttention => "manual check required",
            Self::RolledBack => "rollback performed",
        })
    }
}

/// Everything the operator gets at the end of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run id
    pub run_id: RunId,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Ordered phase log
    pub phases: Vec<PhaseRecord>,
    /// Per-target results, in configuration order
    pub targets: Vec<TargetReport>,
    /// Overall classification
    pub classification: Classification,
    /// Whether this was a dry run
    #[serde(default)]
    pub dry_run: bool,
    /// Full execution log
    pub log_file: Option<PathBuf>,
}

impl RunReport {
    /// Process exit code
    #[inline]
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.classification.exit_code()
    }

    /// Human-readable summary
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "rollguard run {}", self.run_id);
        let _ = writeln!(out, "Phases:");
        for phase in &self.phases {
            match &phase.detail {
                Some(detail) if !detail.is_empty() => {
                    let _ = writeln!(out, "  [{:<4}] {:<24} {}", phase.outcome, phase.name, detail);
                }
                _ => {
                    let _ = writeln!(out, "  [{:<4}] {}", phase.outcome, phase.name);
                }
            }
        }
        let _ = writeln!(out, "Targets:");
        if self.targets.is_empty() {
            let _ = writeln!(out, "  (none monitored)");
        }
        for target in &self.targets {
            let _ = write!(out, "  {:<24} {}", target.name, target.status);
            if let Some(err) = &target.error {
                let _ = write!(out, " ({err})");
            }
            out.push('\n');
        }
        if self.dry_run {
            let _ = writeln!(out, "Result: dry run, nothing deployed (exit {})", self.exit_code());
        } else {
            let _ = writeln!(
                out,
                "Result: {} (exit {})",
                self.classification,
                self.exit_code()
            );
        }
        if let Some(log) = &self.log_file {
            let _ = writeln!(out, "Full log: {}", log.display());
        }
        out
    }

    /// Machine-readable report
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
