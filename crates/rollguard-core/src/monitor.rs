//! Health monitor
//!
//! One polling task per target. Each task owns its [`Target`], samples four
//! independent signals every interval, and returns a [`TargetReport`] that
//! the parent collects after joining every task.
//!
//! A task ends on the first of:
//! - a fully healthy sample that also passes the secondary checks (`success`)
//! - the consecutive-failure counter reaching the threshold (`rolled_back`,
//!   or `unknown` if the rollback cannot complete)
//! - the monitoring window expiring (`timeout`)

use crate::config::{RunConfig, TargetSpec};
use crate::error::{Result, RollguardError};
use crate::phase::TargetReport;
use crate::ports::{ReconcilerBackend, SecondaryCheck, Workloads};
use crate::rollback::RollbackEngine;
use crate::types::{AppStatus, HealthSample, Target, TargetStatus, WorkloadStatus};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What one sample means for the failure counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickVerdict {
    /// Fully healthy; counter reset to 0
    Healthy,
    /// Failure counted, threshold not reached
    Failing {
        /// Consecutive failures so far
        consecutive: u32,
    },
    /// Failure counted and threshold reached
    ThresholdReached,
    /// Neither healthy nor failing; counter unchanged
    Pending,
}

/// Consecutive-failure counter for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureTracker {
    threshold: u32,
    restart_threshold: u32,
    consecutive: u32,
}

impl FailureTracker {
    /// Create new tracker
    #[must_use]
    pub fn new(threshold: u32, restart_threshold: u32) -> Self {
        Self {
            threshold,
            restart_threshold,
            consecutive: 0,
        }
    }

    /// Consecutive failures so far
    #[inline]
    #[must_use]
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Fold one sample into the counter
    pub fn observe(&mut self, sample: &HealthSample) -> TickVerdict {
        if sample.is_fully_healthy() {
            self.consecutive = 0;
            TickVerdict::Healthy
        } else if sample.is_failure(self.restart_threshold) {
            self.consecutive += 1;
            if self.consecutive >= self.threshold {
                TickVerdict::ThresholdReached
            } else {
                TickVerdict::Failing {
                    consecutive: self.consecutive,
                }
            }
        } else {
            TickVerdict::Pending
        }
    }
}

/// Log markers that indicate TLS or certificate trouble
pub const TLS_ERROR_MARKERS: &[&str] = &["certificate", "x509", "tls:"];

/// Lines of `logs` containing a TLS error marker (case-insensitive)
#[must_use]
pub fn scan_for_tls_errors(logs: &str) -> Vec<String> {
    logs.lines()
        .filter(|line| {
            let lower = line.to_ascii_lowercase();
            TLS_ERROR_MARKERS.iter().any(|m| lower.contains(m))
        })
        .map(|line| line.trim().to_string())
        .collect()
}

/// Confirms the workload runs as a non-root (or the configured) uid
#[derive(Debug, Clone, Copy, Default)]
pub struct NonRootIdentityCheck;

#[async_trait::async_trait]
impl SecondaryCheck for NonRootIdentityCheck {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn applies_to(&self, target: &TargetSpec) -> bool {
        target.check_identity || target.expected_uid.is_some()
    }

    async fn check(&self, target: &TargetSpec, workloads: &dyn Workloads) -> Result<bool> {
        let output = workloads.exec(target, &["id", "-u"]).await?;
        let uid: u32 = output.trim().parse().map_err(|_| RollguardError::Parse {
            source_name: format!("id -u in {}", target.name),
            message: format!("not a uid: {:?}", output.trim()),
        })?;
        let ok = match target.expected_uid {
            Some(expected) => uid == expected,
            None => uid != 0,
        };
        if !ok {
            warn!("{} runs as uid {}", target.name, uid);
        }
        Ok(ok)
    }
}

/// Fails while recent workload logs contain TLS error markers
#[derive(Debug, Clone, Copy)]
pub struct LogScanCheck {
    tail: u32,
}

impl LogScanCheck {
    /// Scan the last `tail` lines
    #[must_use]
    pub fn new(tail: u32) -> Self {
        Self { tail }
    }
}

#[async_trait::async_trait]
impl SecondaryCheck for LogScanCheck {
    fn name(&self) -> &'static str {
        "log-scan"
    }

    fn applies_to(&self, target: &TargetSpec) -> bool {
        target.log_scan
    }

    async fn check(&self, target: &TargetSpec, workloads: &dyn Workloads) -> Result<bool> {
        let logs = workloads.logs(target, self.tail).await?;
        let hits = scan_for_tls_errors(&logs);
        if let Some(first) = hits.first() {
            warn!("{}: {} TLS error line(s), first: {}", target.name, hits.len(), first);
        }
        Ok(hits.is_empty())
    }
}

/// Monitoring parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Monitoring window per target
    pub duration: Duration,
    /// Poll interval
    pub interval: Duration,
    /// Consecutive failures that trigger rollback
    pub rollback_threshold: u32,
    /// Restart count above which a sample is failing
    pub restart_threshold: u32,
    /// Skip secondary checks
    pub skip_secondary: bool,
}

impl MonitorSettings {
    /// Settings from a run configuration
    #[must_use]
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            duration: config.monitor_duration,
            interval: config.poll_interval,
            rollback_threshold: config.rollback_threshold,
            restart_threshold: config.restart_threshold,
            skip_secondary: config.skip_secondary,
        }
    }
}

/// Health monitor
pub struct HealthMonitor {
    status_source: Arc<dyn ReconcilerBackend>,
    workloads: Arc<dyn Workloads>,
    rollback: RollbackEngine,
    checks: Vec<Arc<dyn SecondaryCheck>>,
    settings: MonitorSettings,
}

impl HealthMonitor {
    /// Create new monitor
    #[must_use]
    pub fn new(
        status_source: Arc<dyn ReconcilerBackend>,
        workloads: Arc<dyn Workloads>,
        rollback: RollbackEngine,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            status_source,
            workloads,
            rollback,
            checks: Vec::new(),
            settings,
        }
    }

    /// With an additional secondary check
    #[must_use]
    pub fn with_check(mut self, check: Arc<dyn SecondaryCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Monitor every target concurrently; reports come back in input order
    pub async fn monitor_all(self: &Arc<Self>, targets: Vec<Target>) -> Vec<TargetReport> {
        let names: Vec<String> = targets.iter().map(|t| t.name().to_string()).collect();
        info!("Monitoring {} target(s)", targets.len());

        let handles: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let monitor = Arc::clone(self);
                let span = info_span!("target", name = %target.name());
                tokio::spawn(async move { monitor.monitor_target(target).await }.instrument(span))
            })
            .collect();
        let _abort = AbortOnDrop(handles.iter().map(|h| h.abort_handle()).collect());

        join_all(handles)
            .await
            .into_iter()
            .zip(names)
            .map(|(joined, name)| match joined {
                Ok(report) => report,
                Err(e) => {
                    error!("Monitor task for {} died: {}", name, e);
                    TargetReport::unknown(name, format!("monitor task failed: {e}"))
                }
            })
            .collect()
    }

    /// Poll one target until it converges, fails, or times out
    pub async fn monitor_target(&self, mut target: Target) -> TargetReport {
        let spec = Arc::clone(&target.spec);
        let mut tracker = FailureTracker::new(self.settings.rollback_threshold, self.settings.restart_threshold);
        let started = Instant::now();
        let mut samples = 0u32;
        let mut error = None;

        loop {
            let sample = self.sample(&spec).await;
            samples += 1;
            debug!(
                "sample {}: sync={} health={} phase={} ready={}/{} restarts={}",
                samples,
                sample.sync,
                sample.health,
                sample.phase,
                sample.ready_replicas,
                sample.desired_replicas,
                sample.restart_count
            );

            let verdict = tracker.observe(&sample);
            target.consecutive_failures = tracker.consecutive();
            match verdict {
                TickVerdict::Healthy => {
                    if self.secondary_checks_pass(&spec).await {
                        info!("{} converged after {} sample(s)", spec.name, samples);
                        target.status = TargetStatus::Success;
                        break;
                    }
                    debug!("{} converged, secondary checks pending", spec.name);
                }
                TickVerdict::ThresholdReached => {
                    let failure = RollguardError::SustainedFailure {
                        target: spec.name.clone(),
                        failures: tracker.consecutive(),
                    };
                    error!("{}", failure);
                    target.rollback_needed = true;
                    match self.rollback.rollback(&spec, target.backup.as_deref()).await {
                        Ok(()) => {
                            target.status = TargetStatus::RolledBack;
                            error = Some(failure.to_string());
                        }
                        Err(e) => {
                            error!("Rollback of {} failed: {}", spec.name, e);
                            target.status = TargetStatus::Unknown;
                            error = Some(e.to_string());
                        }
                    }
                    break;
                }
                TickVerdict::Failing { consecutive } => {
                    warn!(
                        "{} failing ({}/{}): phase={} restarts={}",
                        spec.name, consecutive, self.settings.rollback_threshold, sample.phase, sample.restart_count
                    );
                }
                TickVerdict::Pending => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.settings.duration {
                let timeout = RollguardError::ConvergenceTimeout {
                    target: spec.name.clone(),
                    waited_secs: elapsed.as_secs(),
                };
                warn!("{}", timeout);
                target.status = TargetStatus::Timeout;
                error = Some(timeout.to_string());
                break;
            }
            let remaining = self.settings.duration.saturating_sub(elapsed);
            tokio::time::sleep(self.settings.interval.min(remaining)).await;
        }

        TargetReport {
            name: spec.name.clone(),
            status: target.status,
            samples,
            consecutive_failures: target.consecutive_failures,
            rollback_invoked: target.rollback_needed,
            elapsed_secs: started.elapsed().as_secs(),
            error,
        }
    }

    /// Gather one sample; unreadable signals become `Unknown`
    pub async fn sample(&self, spec: &TargetSpec) -> HealthSample {
        let (app, workload) = tokio::join!(
            self.status_source.app_status(spec.app_name()),
            self.workloads.status(spec)
        );
        let app = app.unwrap_or_else(|e| {
            debug!("reconciler status for {} unreadable: {}", spec.name, e);
            AppStatus::unknown()
        });
        let workload = workload.unwrap_or_else(|e| {
            debug!("workload status for {} unreadable: {}", spec.name, e);
            WorkloadStatus::unknown()
        });
        HealthSample::from_signals(app, workload)
    }

    async fn secondary_checks_pass(&self, spec: &TargetSpec) -> bool {
        if self.settings.skip_secondary {
            return true;
        }
        for check in self.checks.iter().filter(|c| c.applies_to(spec)) {
            match check.check(spec, self.workloads.as_ref()).await {
                Ok(true) => debug!("{} check passed for {}", check.name(), spec.name),
                Ok(false) => return false,
                Err(e) => {
                    debug!("{} check errored for {}: {}", check.name(), spec.name, e);
                    return false;
                }
            }
        }
        true
    }
}

/// Aborts monitor tasks still running when the join is abandoned
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}
