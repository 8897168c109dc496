//! Sync trigger
//!
//! Asks the reconciler to converge each target. The high-level client is
//! tried first when the session allows it; on failure the session is
//! re-acquired once and the request retried. After that the direct path
//! takes over: request a hard refresh on the declarative object and poll its
//! own status fields.

use crate::auth::{AuthResolver, SessionCell};
use crate::config::{RunConfig, TargetSpec};
use crate::error::Result;
use crate::phase::PhaseRecorder;
use crate::ports::ReconcilerBackend;
use crate::retry::{with_backoff, RetryPolicy};
use crate::types::{AppStatus, SyncStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How a sync request was delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRoute {
    /// Through the high-level client
    Client,
    /// Through a refresh patch on the declarative object
    Direct,
}

/// Result of syncing one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    /// Route used
    pub route: SyncRoute,
    /// Whether the direct poll saw `Synced`/`Healthy`; always true for the client route
    pub converged: bool,
    /// Last status seen on the direct path
    pub last_status: Option<AppStatus>,
    /// Whether the refresh was re-issued
    pub reissued: bool,
}

/// Timing for the direct path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectPollSettings {
    /// Give up after this long
    pub timeout: Duration,
    /// Poll interval
    pub interval: Duration,
    /// Re-issue the refresh once if still out of sync after this long
    pub reissue_after: Duration,
}

impl DirectPollSettings {
    /// Settings from a run configuration
    #[must_use]
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            timeout: config.sync_timeout,
            interval: config.sync_interval,
            reissue_after: config.refresh_reissue_after,
        }
    }
}

/// Sync trigger
pub struct SyncTrigger {
    client: Option<Arc<dyn ReconcilerBackend>>,
    direct: Arc<dyn ReconcilerBackend>,
    resolver: Arc<AuthResolver>,
    session: Arc<SessionCell>,
    retry: RetryPolicy,
    poll: DirectPollSettings,
    recorder: PhaseRecorder,
}

impl SyncTrigger {
    /// Create new trigger. `client` is `None` when the client binary is absent.
    #[must_use]
    pub fn new(
        client: Option<Arc<dyn ReconcilerBackend>>,
        direct: Arc<dyn ReconcilerBackend>,
        resolver: Arc<AuthResolver>,
        session: Arc<SessionCell>,
        retry: RetryPolicy,
        poll: DirectPollSettings,
        recorder: PhaseRecorder,
    ) -> Self {
        Self {
            client,
            direct,
            resolver,
            session,
            retry,
            poll,
            recorder,
        }
    }

    /// Sync every target in order, recording a `sync:<target>` phase for each
    pub async fn sync_all(&self, targets: &[Arc<TargetSpec>]) -> Vec<Result<SyncResult>> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let phase = format!("sync:{}", target.name);
            let result = self.sync_target(target).await;
            match &result {
                Ok(r) if r.route == SyncRoute::Client => {
                    self.recorder.ok(&phase, "requested via client");
                }
                Ok(r) if r.converged => {
                    self.recorder.ok(&phase, "converged via direct refresh");
                }
                Ok(r) => {
                    let last = r
                        .last_status
                        .map(|s| format!("{}/{}", s.sync, s.health))
                        .unwrap_or_else(|| "unknown".to_string());
                    self.recorder.warn(
                        &phase,
                        format!("direct poll timed out after {}s, last {last}", self.poll.timeout.as_secs()),
                    );
                }
                Err(e) => self.recorder.fail(&phase, e.to_string()),
            }
            results.push(result);
        }
        results
    }

    /// Sync one target
    pub async fn sync_target(&self, target: &TargetSpec) -> Result<SyncResult> {
        let app = target.app_name();

        if let Some(client) = &self.client {
            if self.session.current().uses_client() {
                match self.request_via(client.as_ref(), app).await {
                    Ok(()) => return Ok(client_result()),
                    Err(e) => {
                        warn!("Client sync for {} failed: {}; re-acquiring session", app, e);
                        let resolution = self.resolver.reacquire().await;
                        info!("Re-acquired session: {}", resolution.summary());
                        self.session.replace(resolution.session);
                        if self.session.current().uses_client() {
                            match self.request_via(client.as_ref(), app).await {
                                Ok(()) => return Ok(client_result()),
                                Err(e) => warn!("Client sync for {} failed again: {}", app, e),
                            }
                        }
                    }
                }
            }
        }

        self.sync_direct(app).await
    }

    async fn request_via(&self, backend: &dyn ReconcilerBackend, app: &str) -> Result<()> {
        let op = format!("{} sync {}", backend.name(), app);
        with_backoff(&self.retry, &op, || backend.request_sync(app)).await
    }

    async fn refresh(&self, app: &str) -> Result<()> {
        let op = format!("{} refresh {}", self.direct.name(), app);
        with_backoff(&self.retry, &op, || self.direct.hard_refresh(app)).await
    }

    async fn sync_direct(&self, app: &str) -> Result<SyncResult> {
        info!("Requesting hard refresh of {} via {}", app, self.direct.name());
        self.refresh(app).await?;

        let started = Instant::now();
        let mut reissued = false;
        let mut last_status = None;
        loop {
            let status = match self.direct.app_status(app).await {
                Ok(status) => status,
                Err(e) => {
                    debug!("Status read for {} failed: {}", app, e);
                    AppStatus::unknown()
                }
            };
            debug!("{}: sync={} health={}", app, status.sync, status.health);
            last_status = Some(status);

            if status.is_converged() {
                return Ok(SyncResult {
                    route: SyncRoute::Direct,
                    converged: true,
                    last_status,
                    reissued,
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= self.poll.timeout {
                return Ok(SyncResult {
                    route: SyncRoute::Direct,
                    converged: false,
                    last_status,
                    reissued,
                });
            }

            if !reissued && elapsed >= self.poll.reissue_after && status.sync == SyncStatus::OutOfSync {
                info!("{} still OutOfSync after {:?}, re-issuing refresh", app, elapsed);
                if let Err(e) = self.refresh(app).await {
                    warn!("Re-issued refresh for {} failed: {}", app, e);
                }
                reissued = true;
            }

            let remaining = self.poll.timeout.saturating_sub(elapsed);
            tokio::time::sleep(self.poll.interval.min(remaining)).await;
        }
    }
}

fn client_result() -> SyncResult {
    SyncResult {
        route: SyncRoute::Client,
        converged: true,
        last_status: None,
        reissued: false,
    }
}
