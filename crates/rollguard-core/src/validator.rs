//! Prerequisite validation
//!
//! Runs before any mutation. Only connectivity loss is fatal; missing tools
//! and branch drift are recorded as warnings.

use crate::config::RunMode;
use crate::error::{Result, RollguardError};
use crate::phase::PhaseRecorder;
use crate::ports::{ClusterProbe, OperatorPrompt, Repository, ToolInventory};
use std::sync::Arc;
use tracing::info;

/// Tools the pipeline shells out to
pub const REQUIRED_TOOLS: &[&str] = &["kubectl", "git"];

/// High-level reconciler client; the direct path covers its absence
pub const OPTIONAL_CLIENT: &str = "argocd";

/// What validation found out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisites {
    /// Whether the high-level client is installed
    pub client_available: bool,
    /// Branch the repository is on after validation
    pub branch: Option<String>,
}

/// Prerequisite validator
pub struct PrerequisiteValidator {
    probe: Arc<dyn ClusterProbe>,
    tools: Arc<dyn ToolInventory>,
    repo: Arc<dyn Repository>,
    prompt: Arc<dyn OperatorPrompt>,
    recorder: PhaseRecorder,
    mode: RunMode,
    expected_branch: String,
}

impl PrerequisiteValidator {
    /// Create new validator
    #[must_use]
    pub fn new(
        probe: Arc<dyn ClusterProbe>,
        tools: Arc<dyn ToolInventory>,
        repo: Arc<dyn Repository>,
        prompt: Arc<dyn OperatorPrompt>,
        recorder: PhaseRecorder,
        mode: RunMode,
        expected_branch: impl Into<String>,
    ) -> Self {
        Self {
            probe,
            tools,
            repo,
            prompt,
            recorder,
            mode,
            expected_branch: expected_branch.into(),
        }
    }

    /// Run every check. With `mutate == false` the branch is never switched.
    ///
    /// # Errors
    /// Returns `RollguardError::Precondition` when the control plane is unreachable.
    pub async fn validate(&self, mutate: bool) -> Result<Prerequisites> {
        info!("Validating prerequisites");

        if let Err(e) = self.probe.ping().await {
            self.recorder.fail("validate:cluster", e.to_string());
            return Err(RollguardError::Precondition(format!("control plane unreachable: {e}")));
        }
        self.recorder.ok("validate:cluster", "control plane reachable");

        let client_available = self.check_tools();
        let branch = self.check_branch(mutate).await;

        Ok(Prerequisites {
            client_available,
            branch,
        })
    }

    fn check_tools(&self) -> bool {
        let missing: Vec<&str> = REQUIRED_TOOLS
            .iter()
            .copied()
            .filter(|tool| !self.tools.has(tool))
            .collect();
        let client_available = self.tools.has(OPTIONAL_CLIENT);

        let mut notes = Vec::new();
        if !missing.is_empty() {
            notes.push(format!("missing {}", missing.join(", ")));
        }
        if !client_available {
            notes.push(format!("{OPTIONAL_CLIENT} not installed, direct path only"));
        }
        if notes.is_empty() {
            self.recorder.ok("validate:tools", "all tools present");
        } else {
            self.recorder.warn("validate:tools", notes.join("; "));
        }
        client_available
    }

    async fn check_branch(&self, mutate: bool) -> Option<String> {
        let current = match self.repo.current_branch().await {
            Ok(branch) => branch,
            Err(e) => {
                self.recorder.warn("validate:branch", format!("cannot read branch: {e}"));
                return None;
            }
        };
        if current == self.expected_branch {
            self.recorder.ok("validate:branch", format!("on {current}"));
            return Some(current);
        }

        let drift = format!("on {current}, expected {}", self.expected_branch);
        if !mutate {
            self.recorder.warn("validate:branch", drift);
            return Some(current);
        }

        let switch = match self.mode {
            RunMode::Unattended => true,
            RunMode::Interactive => {
                self.prompt
                    .confirm(&format!("Switch from {current} to {}?", self.expected_branch))
                    .await
            }
        };
        if !switch {
            self.recorder.warn("validate:branch", format!("{drift}; switch declined"));
            return Some(current);
        }

        match self.repo.checkout(&self.expected_branch).await {
            Ok(()) => {
                self.recorder
                    .ok("validate:branch", format!("switched {current} -> {}", self.expected_branch));
                Some(self.expected_branch.clone())
            }
            Err(e) => {
                self.recorder.warn("validate:branch", format!("{drift}; checkout failed: {e}"));
                Some(current)
            }
        }
    }
}
