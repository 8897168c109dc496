//! Auth resolver
//!
//! Acquires a session for the reconciler's administrative API through an
//! ordered strategy chain; the first strategy that succeeds wins:
//!
//! 1. cached session, probed with a lightweight read
//! 2. login with the password recovered from the platform secret store
//! 3. token minted through the in-cluster privileged channel
//! 4. direct bypass: base cluster credentials only
//!
//! Every attempt is bounded by a timeout, and strategies 1-3 are skipped
//! when the client binary is absent. Strategy 4 cannot fail, so resolution
//! always produces a session.

use crate::config::ReconcilerSettings;
use crate::error::{Result, RollguardError};
use crate::ports::{AuthClient, SecretStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One link of the auth chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategy {
    /// Reuse the client's existing session
    CachedSession,
    /// Log in with the recovered admin password
    CredentialLogin,
    /// Mint a short-lived admin token
    MintedToken,
    /// Skip the client; use base cluster credentials
    DirectBypass,
}

impl AuthStrategy {
    /// Full chain in order
    pub const CHAIN: [AuthStrategy; 4] = [
        Self::CachedSession,
        Self::CredentialLogin,
        Self::MintedToken,
        Self::DirectBypass,
    ];

    /// Position in the chain (1-based)
    #[inline]
    #[must_use]
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::CachedSession => 1,
            Self::CredentialLogin => 2,
            Self::MintedToken => 3,
            Self::DirectBypass => 4,
        }
    }

    /// Whether the strategy needs the high-level client binary
    #[inline]
    #[must_use]
    pub fn needs_client(&self) -> bool {
        !matches!(self, Self::DirectBypass)
    }
}

impl fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CachedSession => "cached-session",
            Self::CredentialLogin => "credential-login",
            Self::MintedToken => "minted-token",
            Self::DirectBypass => "direct-bypass",
        })
    }
}

/// Result of trying one strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    /// Strategy produced a session
    Succeeded,
    /// Strategy ran and failed
    Failed(String),
    /// Strategy preconditions were not met
    Skipped(String),
}

/// One strategy attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAttempt {
    /// Strategy tried
    pub strategy: AuthStrategy,
    /// What happened
    pub result: AttemptResult,
}

/// Current credential state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    /// Strategy that produced the session
    pub strategy: AuthStrategy,
    /// Id of the token minted for this session
    pub minted_token: Option<String>,
    /// Acquisition time
    pub acquired_at: DateTime<Utc>,
}

impl AuthSession {
    /// Create new session
    #[must_use]
    pub fn new(strategy: AuthStrategy) -> Self {
        Self {
            strategy,
            minted_token: None,
            acquired_at: Utc::now(),
        }
    }

    /// Whether operations may go through the high-level client
    #[inline]
    #[must_use]
    pub fn uses_client(&self) -> bool {
        self.strategy.needs_client()
    }
}

/// Session plus the attempts that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResolution {
    /// Winning session
    pub session: AuthSession,
    /// Attempts in order
    pub attempts: Vec<AuthAttempt>,
}

impl AuthResolution {
    /// Strategies actually executed (not skipped)
    #[must_use]
    pub fn attempted(&self) -> Vec<AuthStrategy> {
        self.attempts
            .iter()
            .filter(|a| !matches!(a.result, AttemptResult::Skipped(_)))
            .map(|a| a.strategy)
            .collect()
    }

    /// One-line summary for the phase log
    #[must_use]
    pub fn summary(&self) -> String {
        let trail: Vec<String> = self
            .attempts
            .iter()
            .map(|a| match &a.result {
                AttemptResult::Succeeded => format!("{} ok", a.strategy),
                AttemptResult::Failed(_) => format!("{} failed", a.strategy),
                AttemptResult::Skipped(_) => format!("{} skipped", a.strategy),
            })
            .collect();
        trail.join(", ")
    }
}

/// Session shared by the sync trigger and the cleanup guard
#[derive(Debug)]
pub struct SessionCell {
    current: Mutex<AuthSession>,
    minted: Mutex<Vec<String>>,
}

impl SessionCell {
    /// Create a cell holding `session`
    #[must_use]
    pub fn new(session: AuthSession) -> Self {
        let minted = session.minted_token.iter().cloned().collect();
        Self {
            current: Mutex::new(session),
            minted: Mutex::new(minted),
        }
    }

    /// Current session
    #[must_use]
    pub fn current(&self) -> AuthSession {
        self.current.lock().clone()
    }

    /// Install a new session; minted tokens are remembered for teardown
    pub fn replace(&self, session: AuthSession) {
        if let Some(id) = &session.minted_token {
            self.minted.lock().push(id.clone());
        }
        *self.current.lock() = session;
    }

    /// Take every minted token id, leaving none behind
    #[must_use]
    pub fn take_minted(&self) -> Vec<String> {
        std::mem::take(&mut *self.minted.lock())
    }
}

/// Auth resolver
pub struct AuthResolver {
    client: Arc<dyn AuthClient>,
    secrets: Arc<dyn SecretStore>,
    settings: ReconcilerSettings,
    client_available: bool,
    attempt_timeout: Duration,
}

impl AuthResolver {
    /// Create new resolver
    #[must_use]
    pub fn new(
        client: Arc<dyn AuthClient>,
        secrets: Arc<dyn SecretStore>,
        settings: ReconcilerSettings,
        client_available: bool,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            client,
            secrets,
            settings,
            client_available,
            attempt_timeout,
        }
    }

    /// Account tokens are minted for
    #[must_use]
    pub fn token_account(&self) -> &str {
        &self.settings.token_account
    }

    /// Walk the full chain
    pub async fn resolve(&self) -> AuthResolution {
        self.resolve_from(AuthStrategy::CachedSession).await
    }

    /// Re-acquire after an authorization failure (starts at credential login)
    pub async fn reacquire(&self) -> AuthResolution {
        self.resolve_from(AuthStrategy::CredentialLogin).await
    }

    /// Walk the chain starting at `first`
    pub async fn resolve_from(&self, first: AuthStrategy) -> AuthResolution {
        let mut attempts = Vec::new();
        for strategy in AuthStrategy::CHAIN.into_iter().filter(|s| *s >= first) {
            if strategy.needs_client() && !self.client_available {
                attempts.push(AuthAttempt {
                    strategy,
                    result: AttemptResult::Skipped("client not installed".to_string()),
                });
                continue;
            }

            debug!("Trying auth strategy {} ({})", strategy.ordinal(), strategy);
            match self.attempt(strategy).await {
                Ok(session) => {
                    info!("Authenticated via {}", strategy);
                    attempts.push(AuthAttempt {
                        strategy,
                        result: AttemptResult::Succeeded,
                    });
                    return AuthResolution { session, attempts };
                }
                Err(e) => {
                    warn!("Auth strategy {} failed: {}", strategy, e);
                    attempts.push(AuthAttempt {
                        strategy,
                        result: AttemptResult::Failed(e.to_string()),
                    });
                }
            }
        }

        // Unreachable in practice: direct bypass never fails.
        attempts.push(AuthAttempt {
            strategy: AuthStrategy::DirectBypass,
            result: AttemptResult::Succeeded,
        });
        AuthResolution {
            session: AuthSession::new(AuthStrategy::DirectBypass),
            attempts,
        }
    }

    async fn attempt(&self, strategy: AuthStrategy) -> Result<AuthSession> {
        match strategy {
            AuthStrategy::CachedSession => {
                self.bounded(strategy, self.client.probe_session()).await?;
                Ok(AuthSession::new(strategy))
            }
            AuthStrategy::CredentialLogin => {
                self.bounded(strategy, self.login()).await?;
                Ok(AuthSession::new(strategy))
            }
            AuthStrategy::MintedToken => {
                let token = self.bounded(strategy, self.mint()).await?;
                let mut session = AuthSession::new(strategy);
                session.minted_token = Some(token);
                Ok(session)
            }
            AuthStrategy::DirectBypass => Ok(AuthSession::new(strategy)),
        }
    }

    async fn login(&self) -> Result<()> {
        let s = &self.settings;
        let password = self
            .secrets
            .read_secret(&s.namespace, &s.secret_name, &s.secret_key)
            .await?;
        if password.trim().is_empty() {
            return Err(RollguardError::Auth(format!(
                "secret {}/{} has an empty {}",
                s.namespace, s.secret_name, s.secret_key
            )));
        }
        self.client.login(&s.username, password.trim()).await
    }

    async fn mint(&self) -> Result<String> {
        let token = self.client.mint_token(&self.settings.token_account).await?;
        if let Err(e) = self.client.use_token(&token).await {
            if let Err(revoke) = self
                .client
                .revoke_token(&self.settings.token_account, &token.id)
                .await
            {
                warn!("Could not revoke unusable token {}: {}", token.id, revoke);
            }
            return Err(e);
        }
        Ok(token.id)
    }

    async fn bounded<T, F>(&self, strategy: AuthStrategy, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.attempt_timeout, fut)
            .await
            .map_err(|_| RollguardError::Timeout {
                operation: format!("auth strategy {strategy}"),
                duration_secs: self.attempt_timeout.as_secs(),
            })?
    }
}
