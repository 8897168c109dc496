//! `argocd`-backed reconciler client and credential handling
//!
//! The high-level client needs an authenticated session. A session comes
//! from the CLI's own config (cached), from `argocd login`, or from an API
//! token minted inside the `argocd-server` workload and held in memory for
//! this run only.

use crate::kubectl::Kubectl;
use crate::parse;
use crate::process::{CommandRunner, Invocation};
use async_trait::async_trait;
use parking_lot::RwLock;
use rollguard_core::{AppStatus, AuthClient, MintedToken, ReconcilerBackend, Result, RollguardError};
use std::sync::Arc;
use tracing::{debug, info};

/// Workload that can mint tokens for the configured account
pub const SERVER_WORKLOAD: &str = "deployment/argocd-server";

/// Prefix of token ids minted by this tool
pub const TOKEN_ID_PREFIX: &str = "rollguard-";

/// `argocd` CLI client
pub struct ArgoCd {
    runner: Arc<dyn CommandRunner>,
    kubectl: Kubectl,
    server: Option<String>,
    namespace: String,
    token: RwLock<Option<String>>,
}

impl std::fmt::Debug for ArgoCd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgoCd")
            .field("server", &self.server)
            .field("namespace", &self.namespace)
            .field("token", &self.token.read().as_ref().map(|_| "***"))
            .finish()
    }
}

impl ArgoCd {
    /// Create new client. `namespace` is where the reconciler runs.
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        kubectl: Kubectl,
        server: Option<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            kubectl,
            server,
            namespace: namespace.into(),
            token: RwLock::new(None),
        }
    }

    /// Whether a minted token is active
    #[must_use]
    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    fn invocation(&self) -> Invocation {
        let mut inv = Invocation::new("argocd");
        if let Some(server) = &self.server {
            inv = inv.args(["--server", server.as_str()]);
        }
        if let Some(token) = self.token.read().as_ref() {
            inv = inv.arg("--auth-token").secret_arg(token.clone());
        }
        inv
    }

    async fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S> + Send,
        S: Into<String>,
    {
        let inv = self.invocation().args(args);
        self.runner.run(&inv).await
    }
}

#[async_trait]
impl ReconcilerBackend for ArgoCd {
    fn name(&self) -> &'static str {
        "argocd"
    }

    async fn request_sync(&self, app: &str) -> Result<()> {
        self.run(["app", "sync", app, "--prune", "--force", "--async"]).await?;
        Ok(())
    }

    async fn app_status(&self, app: &str) -> Result<AppStatus> {
        let json = self.run(["app", "get", app, "-o", "json"]).await?;
        parse::app_status(&json)
    }

    async fn hard_refresh(&self, app: &str) -> Result<()> {
        self.run(["app", "get", app, "--hard-refresh", "-o", "json"]).await?;
        Ok(())
    }
}

#[async_trait]
impl AuthClient for ArgoCd {
    async fn probe_session(&self) -> Result<()> {
        let json = self.run(["account", "get-user-info", "-o", "json"]).await?;
        match parse::logged_in_user(&json)? {
            Some(user) => {
                debug!("argocd session active for {}", user);
                Ok(())
            }
            None => Err(RollguardError::Auth("no active argocd session".to_string())),
        }
    }

    async fn login(&self, username: &str, password: &str) -> Result<()> {
        let server = self
            .server
            .as_deref()
            .ok_or_else(|| RollguardError::Auth("no argocd server configured for login".to_string()))?;
        let inv = Invocation::new("argocd")
            .args(["login", server, "--username", username, "--password"])
            .secret_arg(password)
            .arg("--grpc-web");
        self.runner.run(&inv).await?;
        info!("Logged in to {} as {}", server, username);
        Ok(())
    }

    async fn mint_token(&self, account: &str) -> Result<MintedToken> {
        let id = format!("{TOKEN_ID_PREFIX}{}", ulid::Ulid::new().to_string().to_lowercase());
        let output = self
            .kubectl
            .exec_in(
                &self.namespace,
                SERVER_WORKLOAD,
                &["argocd", "account", "generate-token", "--core", "--account", account, "--id", &id],
            )
            .await?;
        let secret = parse::minted_token(&output)?;
        info!("Minted token {} for {}", id, account);
        Ok(MintedToken { id, secret })
    }

    async fn use_token(&self, token: &MintedToken) -> Result<()> {
        *self.token.write() = Some(token.secret.clone());
        if let Err(e) = self.probe_session().await {
            *self.token.write() = None;
            return Err(e);
        }
        Ok(())
    }

    async fn revoke_token(&self, account: &str, token_id: &str) -> Result<()> {
        self.kubectl
            .exec_in(
                &self.namespace,
                SERVER_WORKLOAD,
                &["argocd", "account", "delete-token", "--core", "--account", account, token_id],
            )
            .await?;
        *self.token.write() = None;
        Ok(())
    }
}
