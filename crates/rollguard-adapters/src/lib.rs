//! Process-backed adapters for rollguard
//!
//! Implements every port in `rollguard_core::ports` by shelling out to
//! `kubectl`, `argocd` and `git`:
//! - [`Kubectl`]: cluster probe, secret store, workload operations
//! - [`DirectReconciler`]: credential-free sync/refresh through the API
//! - [`ArgoCd`]: high-level reconciler client and auth client
//! - [`GitRepository`]: branch checks and commits
//! - [`CommandTransform`]: operator-supplied transform command
//! - [`PathTools`]: tool discovery
//!
//! [`system_ports`] wires them together for a [`RunConfig`].

pub mod argocd;
pub mod git;
pub mod kubectl;
pub mod parse;
pub mod process;
pub mod tools;
pub mod transform;

pub use argocd::ArgoCd;
pub use git::GitRepository;
pub use kubectl::{DirectReconciler, Kubectl};
pub use process::{classify_failure, CommandRunner, Invocation, SystemRunner};
pub use tools::PathTools;
pub use transform::CommandTransform;

use rollguard_core::validator::{OPTIONAL_CLIENT, REQUIRED_TOOLS};
use rollguard_core::{OperatorPrompt, Ports, RunConfig};
use std::sync::Arc;

/// Wire process-backed ports for `config`
///
/// All adapters share `runner`. `push` makes the repository push after
/// each commit.
#[must_use]
pub fn ports_with_runner(
    config: &RunConfig,
    runner: Arc<dyn CommandRunner>,
    prompt: Arc<dyn OperatorPrompt>,
    push: bool,
) -> Ports {
    let kubectl = Kubectl::new(Arc::clone(&runner), config.kube_context.clone());
    let kube = Arc::new(kubectl.clone());
    let argocd = Arc::new(ArgoCd::new(
        Arc::clone(&runner),
        kubectl.clone(),
        config.reconciler.server.clone(),
        config.reconciler.namespace.clone(),
    ));
    let mut tools: Vec<&str> = REQUIRED_TOOLS.to_vec();
    tools.push(OPTIONAL_CLIENT);

    Ports {
        probe: kube.clone(),
        tools: Arc::new(PathTools::probe(&tools)),
        repo: Arc::new(GitRepository::new(Arc::clone(&runner), config.repo_root.clone()).with_push(push)),
        transform: Arc::new(CommandTransform::new(Arc::clone(&runner), config.transform_command.clone())),
        secrets: kube.clone(),
        client: argocd.clone(),
        direct: Arc::new(DirectReconciler::new(kubectl, config.reconciler.namespace.clone())),
        auth: argocd,
        workloads: kube,
        prompt,
    }
}

/// [`ports_with_runner`] with a [`SystemRunner`]
#[must_use]
pub fn system_ports(config: &RunConfig, prompt: Arc<dyn OperatorPrompt>, push: bool) -> Ports {
    ports_with_runner(config, Arc::new(SystemRunner::default()), prompt, push)
}
