//! Run orchestration
//!
//! The pipeline is strictly sequential up to the health monitor:
//! validate, authenticate, apply and commit, trigger sync. The monitor fans
//! out one task per target. Cleanup and reporting go through the
//! [`RunGuard`] on every exit path, including shutdown signals.
//!
//! Two read-only entry points sit next to the pipeline: [`Orchestrator::check`]
//! (current sync/health state) and [`Orchestrator::verify`] (TLS error scan of
//! workload logs).

use crate::applier::ChangeApplier;
use crate::auth::{AuthResolver, SessionCell};
use crate::config::{RunConfig, RunMode, TargetSpec};
use crate::error::{Result, RollguardError};
use crate::guard::{RunGuard, RunState};
use crate::monitor::{scan_for_tls_errors, HealthMonitor, LogScanCheck, MonitorSettings, NonRootIdentityCheck};
use crate::phase::{PhaseRecord, PhaseRecorder, RunReport, TargetReport};
use crate::ports::Ports;
use crate::rollback::RollbackEngine;
use crate::sync::{DirectPollSettings, SyncTrigger};
use crate::types::{AppStatus, RunId, Target, TargetStatus, WorkloadStatus};
use crate::validator::PrerequisiteValidator;
use serde::Serialize;
use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

/// Orchestrator for one configured run
pub struct Orchestrator {
    config: Arc<RunConfig>,
    ports: Ports,
    run_id: RunId,
    log_file: Option<PathBuf>,
}

impl Orchestrator {
    /// Create new orchestrator
    #[must_use]
    pub fn new(config: RunConfig, ports: Ports) -> Self {
        Self {
            config: Arc::new(config),
            ports,
            run_id: RunId::new(),
            log_file: None,
        }
    }

    /// With run id
    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    /// With execution log path (shown in the report)
    #[must_use]
    pub fn with_log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }

    /// Run id
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Run the pipeline until it completes or `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> RunReport
    where
        F: Future<Output = ()>,
    {
        let backup_root = self.config.backup_dir.join(self.run_id.to_string());
        let state = Arc::new(RunState::new(self.run_id, backup_root, self.config.dry_run));
        let guard = RunGuard::new(
            Arc::clone(&state),
            Arc::clone(&self.ports.auth),
            self.config.reconciler.token_account.clone(),
            self.log_file.clone(),
        );

        let span = info_span!("run", run_id = %self.run_id);
        let targets = async {
            info!("Starting run {} ({} target(s))", self.run_id, self.config.targets.len());
            tokio::select! {
                result = self.pipeline(&state) => match result {
                    Ok(reports) => reports,
                    Err(e) => {
                        state.recorder.fail("run", format!("aborted: {e}"));
                        self.unmonitored("not monitored, run aborted")
                    }
                },
                () = shutdown => {
                    state.recorder.fail("run", "interrupted by signal");
                    self.unmonitored("interrupted")
                }
            }
        }
        .instrument(span)
        .await;

        guard.finish(targets).await
    }

    fn unmonitored(&self, reason: &str) -> Vec<TargetReport> {
        if self.config.dry_run {
            return Vec::new();
        }
        self.config
            .targets
            .iter()
            .map(|t| TargetReport::unknown(t.name.clone(), reason))
            .collect()
    }

    async fn pipeline(&self, state: &RunState) -> Result<Vec<TargetReport>> {
        let config = &self.config;
        let ports = &self.ports;
        let recorder = &state.recorder;
        let specs: Vec<Arc<TargetSpec>> = config.targets.iter().cloned().map(Arc::new).collect();

        let prereqs = self.validator(recorder.clone()).validate(true).await?;

        let resolver = Arc::new(AuthResolver::new(
            Arc::clone(&ports.auth),
            Arc::clone(&ports.secrets),
            config.reconciler.clone(),
            prereqs.client_available,
            config.auth_timeout,
        ));
        let resolution = resolver.resolve().await;
        if resolution.session.uses_client() {
            recorder.ok("auth", resolution.summary());
        } else {
            recorder.warn("auth", format!("direct path only ({})", resolution.summary()));
        }
        let session = Arc::new(SessionCell::new(resolution.session));
        state.set_session(Arc::clone(&session));

        let applier = ChangeApplier::new(
            Arc::clone(&ports.repo),
            Arc::clone(&ports.transform),
            Arc::clone(&ports.workloads),
            Arc::clone(&state.store),
            recorder.clone(),
            Arc::clone(&state.committed),
            config.dry_run,
            config.commit_message.clone(),
        );
        let applied = applier.apply(&specs).await;
        if applied.is_failure() && config.mode == RunMode::Interactive {
            let proceed = ports
                .prompt
                .confirm("Apply failed. Continue to sync and monitoring?")
                .await;
            if !proceed {
                return Err(RollguardError::Apply(
                    applied.error.unwrap_or_else(|| "apply failed".to_string()),
                ));
            }
        }

        if config.dry_run {
            recorder.skip("sync", "dry run");
            recorder.skip("monitor", "dry run");
            return Ok(Vec::new());
        }

        if config.skip_deploy {
            recorder.skip("sync", "skip-deploy");
        } else {
            let client = prereqs.client_available.then(|| Arc::clone(&ports.client));
            let trigger = SyncTrigger::new(
                client,
                Arc::clone(&ports.direct),
                resolver,
                Arc::clone(&session),
                config.retry,
                DirectPollSettings::from_config(config),
                recorder.clone(),
            );
            trigger.sync_all(&specs).await;
        }

        let monitor = Arc::new(
            HealthMonitor::new(
                Arc::clone(&ports.direct),
                Arc::clone(&ports.workloads),
                RollbackEngine::new(Arc::clone(&ports.workloads), config.retry, config.settle_delay),
                MonitorSettings::from_config(config),
            )
            .with_check(Arc::new(NonRootIdentityCheck))
            .with_check(Arc::new(LogScanCheck::new(config.log_tail))),
        );
        let targets: Vec<Target> = specs
            .iter()
            .map(|spec| Target::new(Arc::clone(spec)).with_backup(state.store.get(&spec.name)))
            .collect();
        let reports = monitor.monitor_all(targets).await;
        record_monitor(recorder, &reports);
        Ok(reports)
    }

    fn validator(&self, recorder: PhaseRecorder) -> PrerequisiteValidator {
        PrerequisiteValidator::new(
            Arc::clone(&self.ports.probe),
            Arc::clone(&self.ports.tools),
            Arc::clone(&self.ports.repo),
            Arc::clone(&self.ports.prompt),
            recorder,
            self.config.mode,
            self.config.expected_branch.clone(),
        )
    }

    /// Read-only status of every target
    pub async fn check(&self) -> CheckReport {
        let recorder = PhaseRecorder::new();
        if let Err(e) = self.validator(recorder.clone()).validate(false).await {
            return CheckReport {
                phases: recorder.snapshot(),
                targets: Vec::new(),
                error: Some(e.to_string()),
            };
        }

        let mut targets = Vec::with_capacity(self.config.targets.len());
        for spec in &self.config.targets {
            let (app, workload) = tokio::join!(
                self.ports.direct.app_status(spec.app_name()),
                self.ports.workloads.status(spec)
            );
            let mut errors = Vec::new();
            let app = app.unwrap_or_else(|e| {
                errors.push(e.to_string());
                AppStatus::unknown()
            });
            let workload = workload.map_err(|e| errors.push(e.to_string())).ok();
            targets.push(CheckEntry {
                name: spec.name.clone(),
                app,
                workload,
                error: (!errors.is_empty()).then(|| errors.join("; ")),
            });
        }

        CheckReport {
            phases: recorder.snapshot(),
            targets,
            error: None,
        }
    }

    /// Scan each target's recent logs for TLS/certificate errors
    pub async fn verify(&self) -> VerifyReport {
        let recorder = PhaseRecorder::new();
        let mut targets = Vec::with_capacity(self.config.targets.len());
        for spec in &self.config.targets {
            let phase = format!("verify:{}", spec.name);
            let entry = match self.ports.workloads.logs(spec, self.config.log_tail).await {
                Ok(logs) => {
                    let hits = scan_for_tls_errors(&logs);
                    if hits.is_empty() {
                        recorder.ok(&phase, "no TLS errors in recent logs");
                    } else {
                        recorder.warn(&phase, format!("{} TLS error line(s)", hits.len()));
                    }
                    VerifyEntry {
                        name: spec.name.clone(),
                        hits,
                        error: None,
                    }
                }
                Err(e) => {
                    recorder.warn(&phase, format!("cannot read logs: {e}"));
                    VerifyEntry {
                        name: spec.name.clone(),
                        hits: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            };
            targets.push(entry);
        }
        VerifyReport {
            phases: recorder.snapshot(),
            targets,
        }
    }
}

fn record_monitor(recorder: &PhaseRecorder, reports: &[TargetReport]) {
    let count = |status| reports.iter().filter(|r| r.status == status).count();
    let summary = format!(
        "{} success, {} rolled back, {} timeout, {} unknown",
        count(TargetStatus::Success),
        count(TargetStatus::RolledBack),
        count(TargetStatus::Timeout),
        count(TargetStatus::Unknown)
    );
    if count(TargetStatus::RolledBack) + count(TargetStatus::Unknown) > 0 {
        recorder.fail("monitor", summary);
    } else if count(TargetStatus::Timeout) > 0 {
        recorder.warn("monitor", summary);
    } else {
        recorder.ok("monitor", summary);
    }
}

/// Status of one target as seen by `check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckEntry {
    /// Target name
    pub name: String,
    /// Reconciler view
    pub app: AppStatus,
    /// Workload view
    pub workload: Option<WorkloadStatus>,
    /// Read errors
    pub error: Option<String>,
}

/// Output of `check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    /// Validation phases
    pub phases: Vec<PhaseRecord>,
    /// Per-target status
    pub targets: Vec<CheckEntry>,
    /// Fatal validation error
    pub error: Option<String>,
}

impl CheckReport {
    /// 0 when every target is `Synced`/`Healthy`, else 1
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        let healthy = self.error.is_none()
            && !self.targets.is_empty()
            && self.targets.iter().all(|t| t.app.is_converged());
        if healthy {
            0
        } else {
            1
        }
    }

    /// Human-readable summary
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for phase in &self.phases {
            let _ = writeln!(
                out,
                "[{:<4}] {} {}",
                phase.outcome,
                phase.name,
                phase.detail.as_deref().unwrap_or("")
            );
        }
        if let Some(err) = &self.error {
            let _ = writeln!(out, "error: {err}");
        }
        for t in &self.targets {
            let _ = write!(out, "{:<24} {}/{}", t.name, t.app.sync, t.app.health);
            if let Some(w) = &t.workload {
                let _ = write!(out, " {} {}/{} ready, {} restarts", w.phase, w.ready, w.desired, w.restarts);
            }
            if let Some(err) = &t.error {
                let _ = write!(out, " ({err})");
            }
            out.push('\n');
        }
        out
    }
}

/// Log scan result for one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyEntry {
    /// Target name
    pub name: String,
    /// Matching log lines
    pub hits: Vec<String>,
    /// Read error
    pub error: Option<String>,
}

/// Output of `verify`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// One phase per target
    pub phases: Vec<PhaseRecord>,
    /// Per-target scan results
    pub targets: Vec<VerifyEntry>,
}

impl VerifyReport {
    /// 0 when every target's logs were read and are clean, else 1
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        let clean = self
            .targets
            .iter()
            .all(|t| t.error.is_none() && t.hits.is_empty());
        if clean {
            0
        } else {
            1
        }
    }

    /// Human-readable summary
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for t in &self.targets {
            match (&t.error, t.hits.is_empty()) {
                (Some(err), _) => {
                    let _ = writeln!(out, "{:<24} unreadable ({err})", t.name);
                }
                (None, true) => {
                    let _ = writeln!(out, "{:<24} clean", t.name);
                }
                (None, false) => {
                    let _ = writeln!(out, "{:<24} {} TLS error line(s)", t.name, t.hits.len());
                    for hit in &t.hits {
                        let _ = writeln!(out, "    {hit}");
                    }
                }
            }
        }
        out
    }
}

