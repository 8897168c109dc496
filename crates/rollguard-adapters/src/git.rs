//! `git`-backed repository port

use crate::process::{CommandRunner, Invocation};
use async_trait::async_trait;
use rollguard_core::{Repository, Result, RollguardError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Working copy driven through the `git` CLI
pub struct GitRepository {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
    push: bool,
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepository")
            .field("root", &self.root)
            .field("push", &self.push)
            .finish()
    }
}

impl GitRepository {
    /// Create new repository rooted at `root`
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            root: root.into(),
            push: false,
        }
    }

    /// Push the branch after every commit
    #[must_use]
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    fn git(&self) -> Invocation {
        Invocation::new("git").current_dir(&self.root)
    }

    /// `path` relative to the repository root when it lies inside it
    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }
}

#[async_trait]
impl Repository for GitRepository {
    async fn current_branch(&self) -> Result<String> {
        let out = self
            .runner
            .run(&self.git().args(["rev-parse", "--abbrev-ref", "HEAD"]))
            .await?;
        let branch = out.trim();
        if branch.is_empty() || branch == "HEAD" {
            return Err(RollguardError::Parse {
                source_name: "git rev-parse".to_string(),
                message: "detached HEAD".to_string(),
            });
        }
        Ok(branch.to_string())
    }

    async fn checkout(&self, branch: &str) -> Result<()> {
        self.runner.run(&self.git().args(["checkout", branch])).await?;
        Ok(())
    }

    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<String> {
        let files: Vec<String> = paths
            .iter()
            .map(|p| self.relative(p).display().to_string())
            .collect();

        self.runner
            .run(&self.git().args(["add", "--"]).args(files.iter().cloned()))
            .await?;
        self.runner
            .run(&self.git().args(["commit", "-m", message, "--"]).args(files))
            .await?;
        let id = self
            .runner
            .run(&self.git().args(["rev-parse", "--short", "HEAD"]))
            .await?
            .trim()
            .to_string();
        info!("Committed {} file(s) as {}", paths.len(), id);

        if self.push {
            self.runner.run(&self.git().arg("push")).await?;
            info!("Pushed {}", id);
        }
        Ok(id)
    }
}
