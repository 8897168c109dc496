//! `kubectl`-backed cluster access
//!
//! [`Kubectl`] implements the cluster probe, the secret store and the
//! workload operations. [`DirectReconciler`] drives reconciler
//! `Application` objects with plain API verbs (annotate, merge-patch, get),
//! so it works with base cluster credentials and no reconciler login.

use crate::parse;
use crate::process::{CommandRunner, Invocation};
use async_trait::async_trait;
use rollguard_core::{
    AppStatus, ClusterProbe, ReconcilerBackend, Result, SecretStore, TargetSpec, WorkloadStatus, Workloads,
};
use std::sync::Arc;
use tracing::debug;

/// Resource name of reconciler applications
pub const APPLICATION_RESOURCE: &str = "applications.argoproj.io";

/// Annotation that asks the reconciler for a hard refresh
pub const REFRESH_ANNOTATION: &str = "argocd.argoproj.io/refresh=hard";

/// `kubectl` with an optional fixed context
#[derive(Clone)]
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    context: Option<String>,
}

impl std::fmt::Debug for Kubectl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kubectl").field("context", &self.context).finish()
    }
}

impl Kubectl {
    /// Create new client; `context` is passed to every invocation
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, context: Option<String>) -> Self {
        Self { runner, context }
    }

    /// Base invocation with `--context` applied
    #[must_use]
    pub fn invocation(&self) -> Invocation {
        let inv = Invocation::new("kubectl");
        match &self.context {
            Some(context) => inv.arg(format!("--context={context}")),
            None => inv,
        }
    }

    /// Run `kubectl <args>`
    pub async fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S> + Send,
        S: Into<String>,
    {
        self.runner.run(&self.invocation().args(args)).await
    }

    /// Run `kubectl exec` in `workload` of `namespace`
    pub async fn exec_in(&self, namespace: &str, workload: &str, command: &[&str]) -> Result<String> {
        let inv = self
            .invocation()
            .args(["exec", "-n", namespace, workload, "--"])
            .args(command.iter().copied());
        self.runner.run(&inv).await
    }
}

#[async_trait]
impl ClusterProbe for Kubectl {
    async fn ping(&self) -> Result<()> {
        self.run(["cluster-info", "--request-timeout=10s"]).await?;
        Ok(())
    }
}

/// JSONPath key segment with dots escaped (`tls.crt` -> `tls\.crt`)
fn jsonpath_key(key: &str) -> String {
    key.replace('.', "\\.")
}

#[async_trait]
impl SecretStore for Kubectl {
    async fn read_secret(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let jsonpath = format!("jsonpath={{.data.{}}}", jsonpath_key(key));
        let encoded = self
            .run(["get", "secret", name, "-n", namespace, "-o", jsonpath.as_str()])
            .await?;
        parse::decode_secret(&encoded)
    }
}

#[async_trait]
impl Workloads for Kubectl {
    async fn scale(&self, target: &TargetSpec, replicas: u32) -> Result<()> {
        let workload = target.workload_ref();
        let replicas = format!("--replicas={replicas}");
        self.run(["scale", workload.as_str(), "-n", target.namespace.as_str(), replicas.as_str()])
            .await?;
        Ok(())
    }

    async fn status(&self, target: &TargetSpec) -> Result<WorkloadStatus> {
        let workload = target.workload_ref();
        let ns = target.namespace.as_str();
        let json = self.run(["get", workload.as_str(), "-n", ns, "-o", "json"]).await?;
        let summary = parse::workload_summary(&json)?;
        let pods = self
            .run(["get", "pods", "-n", ns, "-l", summary.selector.as_str(), "-o", "json"])
            .await?;
        let status = parse::workload_status(&summary, &pods)?;
        debug!("{}: {:?}", workload, status);
        Ok(status)
    }

    async fn exec(&self, target: &TargetSpec, command: &[&str]) -> Result<String> {
        self.exec_in(&target.namespace, &target.workload_ref(), command).await
    }

    async fn export_manifest(&self, target: &TargetSpec) -> Result<String> {
        let workload = target.workload_ref();
        let yaml = self
            .run(["get", workload.as_str(), "-n", target.namespace.as_str(), "-o", "yaml"])
            .await?;
        parse::sanitize_manifest(&yaml)
    }

    async fn apply_manifest(&self, target: &TargetSpec, manifest: &str) -> Result<()> {
        let inv = self
            .invocation()
            .args(["apply", "-n", target.namespace.as_str(), "-f", "-"])
            .stdin(manifest);
        self.runner.run(&inv).await?;
        Ok(())
    }

    async fn logs(&self, target: &TargetSpec, tail: u32) -> Result<String> {
        let workload = target.workload_ref();
        let tail = format!("--tail={tail}");
        self.run([
            "logs",
            workload.as_str(),
            "-n",
            target.namespace.as_str(),
            tail.as_str(),
            "--all-containers=true",
        ])
        .await
    }
}

/// Reconciler backend that needs only base cluster credentials
#[derive(Debug, Clone)]
pub struct DirectReconciler {
    kubectl: Kubectl,
    namespace: String,
}

impl DirectReconciler {
    /// Create new backend for applications in `namespace`
    #[must_use]
    pub fn new(kubectl: Kubectl, namespace: impl Into<String>) -> Self {
        Self {
            kubectl,
            namespace: namespace.into(),
        }
    }
}

/// Merge patch that starts a pruning sync operation
#[must_use]
pub fn sync_operation_patch() -> String {
    serde_json::json!({
        "operation": {
            "initiatedBy": { "username": "rollguard" },
            "sync": { "prune": true }
        }
    })
    .to_string()
}

#[async_trait]
impl ReconcilerBackend for DirectReconciler {
    fn name(&self) -> &'static str {
        "kubectl"
    }

    async fn request_sync(&self, app: &str) -> Result<()> {
        let patch = sync_operation_patch();
        self.kubectl
            .run([
                "patch",
                APPLICATION_RESOURCE,
                app,
                "-n",
                self.namespace.as_str(),
                "--type",
                "merge",
                "-p",
                patch.as_str(),
            ])
            .await?;
        Ok(())
    }

    async fn app_status(&self, app: &str) -> Result<AppStatus> {
        let json = self
            .kubectl
            .run(["get", APPLICATION_RESOURCE, app, "-n", self.namespace.as_str(), "-o", "json"])
            .await?;
        parse::app_status(&json)
    }

    async fn hard_refresh(&self, app: &str) -> Result<()> {
        self.kubectl
            .run([
                "annotate",
                APPLICATION_RESOURCE,
                app,
                "-n",
                self.namespace.as_str(),
                REFRESH_ANNOTATION,
                "--overwrite",
            ])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_dotted_secret_keys() {
        assert_eq!(jsonpath_key("password"), "password");
        assert_eq!(jsonpath_key("tls.crt"), "tls\\.crt");
    }

    #[test]
    fn sync_patch_prunes() {
        let patch: serde_json::Value = serde_json::from_str(&sync_operation_patch()).unwrap();
        assert_eq!(patch["operation"]["sync"]["prune"], serde_json::Value::Bool(true));
    }
}
