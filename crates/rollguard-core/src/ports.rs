//! Ports to external collaborators
//!
//! Every side effect the engine performs goes through one of these traits.
//! Process-backed implementations live in `rollguard-adapters`; scripted
//! fakes live in `rollguard-test-utils`.

use crate::config::TargetSpec;
use crate::error::Result;
use crate::types::{AppStatus, WorkloadStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Control-plane connectivity probe
#[async_trait::async_trait]
pub trait ClusterProbe: Send + Sync {
    /// Succeeds when the control plane answers
    async fn ping(&self) -> Result<()>;
}

/// Which command line tools are installed
pub trait ToolInventory: Send + Sync {
    /// Check whether `tool` can be executed
    fn has(&self, tool: &str) -> bool;
}

/// Version-controlled configuration repository
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    /// Current branch name
    async fn current_branch(&self) -> Result<String>;

    /// Switch to `branch`
    async fn checkout(&self, branch: &str) -> Result<()>;

    /// Stage `paths` and commit them; returns the commit id
    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<String>;
}

/// External configuration transform, applied in place to one file
#[async_trait::async_trait]
pub trait ConfigTransform: Send + Sync {
    /// Rewrite `path`
    async fn transform(&self, path: &Path) -> Result<()>;
}

/// Platform secret store
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// Read and decode one key of a secret
    async fn read_secret(&self, namespace: &str, name: &str, key: &str) -> Result<String>;
}

/// A route to the GitOps reconciler
///
/// Two backends exist: the high-level authenticated client and the direct
/// path that patches the declarative object with base cluster credentials.
#[async_trait::async_trait]
pub trait ReconcilerBackend: Send + Sync {
    /// Backend name for logs and reports
    fn name(&self) -> &'static str;

    /// Ask the reconciler to converge `app` with force and prune
    async fn request_sync(&self, app: &str) -> Result<()>;

    /// Read the sync and health status of `app`
    async fn app_status(&self, app: &str) -> Result<AppStatus>;

    /// Request a hard refresh of `app`
    async fn hard_refresh(&self, app: &str) -> Result<()>;
}

/// A token minted for the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedToken {
    /// Token id, used to revoke it
    pub id: String,
    /// Bearer value
    pub secret: String,
}

/// Session management for the high-level reconciler client
#[async_trait::async_trait]
pub trait AuthClient: Send + Sync {
    /// Lightweight authenticated read; succeeds if the cached session is valid
    async fn probe_session(&self) -> Result<()>;

    /// Log in with username and password
    async fn login(&self, username: &str, password: &str) -> Result<()>;

    /// Mint a short-lived administrative token through the in-cluster channel
    async fn mint_token(&self, account: &str) -> Result<MintedToken>;

    /// Make `token` the active session
    async fn use_token(&self, token: &MintedToken) -> Result<()>;

    /// Revoke a token minted earlier
    async fn revoke_token(&self, account: &str, token_id: &str) -> Result<()>;
}

/// Workload orchestrator operations on one target
#[async_trait::async_trait]
pub trait Workloads: Send + Sync {
    /// Scale the target's workload
    async fn scale(&self, target: &TargetSpec, replicas: u32) -> Result<()>;

    /// Phase, readiness and restarts of the target's workload
    async fn status(&self, target: &TargetSpec) -> Result<WorkloadStatus>;

    /// Run a command inside the workload
    async fn exec(&self, target: &TargetSpec, command: &[&str]) -> Result<String>;

    /// Export the workload's declarative manifest
    async fn export_manifest(&self, target: &TargetSpec) -> Result<String>;

    /// Apply a declarative manifest for the workload
    async fn apply_manifest(&self, target: &TargetSpec, manifest: &str) -> Result<()>;

    /// Last `tail` log lines of the workload
    async fn logs(&self, target: &TargetSpec, tail: u32) -> Result<String>;
}

/// Operator confirmation in interactive mode
#[async_trait::async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Ask a yes/no question
    async fn confirm(&self, question: &str) -> bool;
}

/// Prompt that always declines; used in unattended mode
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverConfirm;

#[async_trait::async_trait]
impl OperatorPrompt for NeverConfirm {
    async fn confirm(&self, _question: &str) -> bool {
        false
    }
}

/// Domain-specific check run after a target converges
#[async_trait::async_trait]
pub trait SecondaryCheck: Send + Sync {
    /// Check name for logs
    fn name(&self) -> &'static str;

    /// Whether this check is configured for `target`
    fn applies_to(&self, target: &TargetSpec) -> bool;

    /// `Ok(true)` when the target passes
    async fn check(&self, target: &TargetSpec, workloads: &dyn Workloads) -> Result<bool>;
}

/// Every port the engine needs, wired once at startup
#[derive(Clone)]
pub struct Ports {
    /// Connectivity probe
    pub probe: Arc<dyn ClusterProbe>,
    /// Installed tools
    pub tools: Arc<dyn ToolInventory>,
    /// Configuration repository
    pub repo: Arc<dyn Repository>,
    /// External transform
    pub transform: Arc<dyn ConfigTransform>,
    /// Secret store
    pub secrets: Arc<dyn SecretStore>,
    /// High-level reconciler client
    pub client: Arc<dyn ReconcilerBackend>,
    /// Direct reconciler path
    pub direct: Arc<dyn ReconcilerBackend>,
    /// Client session management
    pub auth: Arc<dyn AuthClient>,
    /// Workload orchestrator
    pub workloads: Arc<dyn Workloads>,
    /// Operator prompt
    pub prompt: Arc<dyn OperatorPrompt>,
}

impl std::fmt::Debug for Ports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ports")
            .field("client", &self.client.name())
            .field("direct", &self.direct.name())
            .finish_non_exhaustive()
    }
}
