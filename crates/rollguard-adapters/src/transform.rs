//! External configuration transform
//!
//! The transform is an operator-supplied shell command. `{file}` in the
//! command is replaced by the file being transformed (passed as `$1`, so
//! paths with spaces survive); without a placeholder the path is appended.

use crate::process::{CommandRunner, Invocation};
use async_trait::async_trait;
use rollguard_core::{ConfigTransform, Result, RollguardError};
use std::path::Path;
use std::sync::Arc;

/// Placeholder for the file path
pub const FILE_PLACEHOLDER: &str = "{file}";

/// Transform that runs a shell command per file
pub struct CommandTransform {
    runner: Arc<dyn CommandRunner>,
    command: Option<String>,
}

impl std::fmt::Debug for CommandTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandTransform")
            .field("command", &self.command)
            .finish()
    }
}

impl CommandTransform {
    /// Create new transform; `None` fails every call
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, command: Option<String>) -> Self {
        Self { runner, command }
    }

    /// Shell invocation for `path`
    pub fn invocation(&self, path: &Path) -> Result<Invocation> {
        let command = self
            .command
            .as_deref()
            .ok_or_else(|| RollguardError::Config("no transform_command configured".to_string()))?;
        let script = if command.contains(FILE_PLACEHOLDER) {
            command.replace(FILE_PLACEHOLDER, "\"$1\"")
        } else {
            format!("{command} \"$1\"")
        };
        Ok(Invocation::new("sh")
            .args(["-c", script.as_str(), "rollguard-transform"])
            .arg(path.display().to_string()))
    }
}

#[async_trait]
impl ConfigTransform for CommandTransform {
    async fn transform(&self, path: &Path) -> Result<()> {
        let inv = self.invocation(path)?;
        self.runner.run(&inv).await.map_err(|e| match e {
            RollguardError::Command { stderr, status, .. } => {
                RollguardError::Apply(format!("transform of {} failed ({status}): {stderr}", path.display()))
            }
            other => other,
        })?;
        Ok(())
    }
}
