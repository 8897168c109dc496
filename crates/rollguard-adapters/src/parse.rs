//! Parsing of `kubectl` and `argocd` output
//!
//! Pure functions over the text the tools print, kept apart from the
//! process plumbing so they can be tested on captured fixtures.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rollguard_core::{AppStatus, HealthStatus, Result, SyncStatus, RollguardError, WorkloadPhase, WorkloadStatus};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Metadata fields the API server owns; stripped before re-apply
pub const SERVER_OWNED_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
];

const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

fn parse_error(source_name: &str, message: impl ToString) -> RollguardError {
    RollguardError::Parse {
        source_name: source_name.to_string(),
        message: message.to_string(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Application {
    status: ApplicationStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApplicationStatus {
    sync: StatusField,
    health: StatusField,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatusField {
    status: String,
}

/// Sync and health of an `Application` object (`-o json`)
///
/// Missing fields and unlisted values read as `Unknown`.
pub fn app_status(json: &str) -> Result<AppStatus> {
    let app: Application = serde_json::from_str(json).map_err(|e| parse_error("application", e))?;
    let sync: SyncStatus = app.status.sync.status.parse().unwrap_or(SyncStatus::Unknown);
    let health: HealthStatus = app.status.health.status.parse().unwrap_or(HealthStatus::Unknown);
    Ok(AppStatus::new(sync, health))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Deployment {
    spec: DeploymentSpec,
    status: DeploymentStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DeploymentSpec {
    replicas: Option<u32>,
    selector: Selector,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Selector {
    match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DeploymentStatus {
    ready_replicas: u32,
}

/// Replica counts and label selector of a workload object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSummary {
    /// Desired replicas (`spec.replicas`, default 1)
    pub desired: u32,
    /// Ready replicas
    pub ready: u32,
    /// `k=v,k=v` selector for its pods
    pub selector: String,
}

/// Summary of a deployment or statefulset (`-o json`)
pub fn workload_summary(json: &str) -> Result<WorkloadSummary> {
    let deployment: Deployment = serde_json::from_str(json).map_err(|e| parse_error("workload", e))?;
    if deployment.spec.selector.match_labels.is_empty() {
        return Err(parse_error("workload", "no spec.selector.matchLabels"));
    }
    let selector = deployment
        .spec
        .selector
        .match_labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    Ok(WorkloadSummary {
        desired: deployment.spec.replicas.unwrap_or(1),
        ready: deployment.status.ready_replicas,
        selector,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodList {
    items: Vec<Pod>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Pod {
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodStatus {
    phase: String,
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ContainerStatus {
    restart_count: u32,
    state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContainerState {
    waiting: Option<Reason>,
    terminated: Option<Reason>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Reason {
    reason: String,
}

fn severity(phase: &WorkloadPhase) -> u8 {
    match phase {
        WorkloadPhase::CrashLoopBackOff | WorkloadPhase::OOMKilled | WorkloadPhase::Error => 5,
        WorkloadPhase::Failed => 4,
        WorkloadPhase::Other(_) => 3,
        WorkloadPhase::Pending => 2,
        WorkloadPhase::Running => 1,
        WorkloadPhase::Succeeded | WorkloadPhase::Absent => 0,
    }
}

fn pod_phase(pod: &Pod) -> WorkloadPhase {
    let mut worst: WorkloadPhase = pod.status.phase.parse().unwrap_or(WorkloadPhase::Absent);
    for container in &pod.status.container_statuses {
        let reasons = [container.state.waiting.as_ref(), container.state.terminated.as_ref()];
        for reason in reasons.into_iter().flatten() {
            let phase: WorkloadPhase = reason.reason.parse().unwrap_or(WorkloadPhase::Absent);
            if phase.is_crash_like() && severity(&phase) > severity(&worst) {
                worst = phase;
            }
        }
    }
    worst
}

/// Worst pod phase and highest restart count across a pod list (`-o json`)
///
/// Current container waiting/terminated reasons override the pod phase when they are
/// crash-like, so a `Running` pod in `CrashLoopBackOff` reports the latter.
pub fn workload_status(summary: &WorkloadSummary, pods_json: &str) -> Result<WorkloadStatus> {
    let pods: PodList = serde_json::from_str(pods_json).map_err(|e| parse_error("pods", e))?;
    let mut phase = WorkloadPhase::Absent;
    let mut restarts = 0;
    for pod in &pods.items {
        let candidate = pod_phase(pod);
        if phase == WorkloadPhase::Absent || severity(&candidate) > severity(&phase) {
            phase = candidate;
        }
        restarts = pod
            .status
            .container_statuses
            .iter()
            .map(|c| c.restart_count)
            .fold(restarts, u32::max);
    }
    Ok(WorkloadStatus {
        phase,
        ready: summary.ready,
        desired: summary.desired,
        restarts,
    })
}

/// Strip server-owned fields from an exported manifest so it can be re-applied
pub fn sanitize_manifest(yaml: &str) -> Result<String> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| parse_error("manifest", e))?;
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| parse_error("manifest", "top level is not a mapping"))?;
    root.remove("status");
    if let Some(metadata) = root.get_mut("metadata").and_then(serde_yaml::Value::as_mapping_mut) {
        for field in SERVER_OWNED_METADATA {
            metadata.remove(*field);
        }
        let drop_annotations = match metadata
            .get_mut("annotations")
            .and_then(serde_yaml::Value::as_mapping_mut)
        {
            Some(annotations) => {
                annotations.remove(LAST_APPLIED);
                annotations.is_empty()
            }
            None => false,
        };
        if drop_annotations {
            metadata.remove("annotations");
        }
    }
    serde_yaml::to_string(&doc).map_err(|e| parse_error("manifest", e))
}

/// Decode a base64 secret value as printed by `-o jsonpath`
pub fn decode_secret(encoded: &str) -> Result<String> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(parse_error("secret", "key missing or empty"));
    }
    let bytes = STANDARD.decode(encoded).map_err(|e| parse_error("secret", e))?;
    String::from_utf8(bytes).map_err(|e| parse_error("secret", e))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UserInfo {
    logged_in: bool,
    username: String,
}

/// `Some(username)` when `argocd account get-user-info -o json` reports a session
pub fn logged_in_user(json: &str) -> Result<Option<String>> {
    let info: UserInfo = serde_json::from_str(json).map_err(|e| parse_error("user info", e))?;
    Ok(info.logged_in.then_some(info.username))
}

/// Token printed by `argocd account generate-token`
pub fn minted_token(output: &str) -> Result<String> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    match (lines.next(), lines.next()) {
        (Some(token), None) if !token.contains(char::is_whitespace) => Ok(token.to_string()),
        (None, _) => Err(parse_error("generate-token", "empty output")),
        _ => Err(parse_error("generate-token", "expected a single token line")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DEPLOYMENT: &str = r#"{
        "spec": {"replicas": 2, "selector": {"matchLabels": {"app.kubernetes.io/name": "grafana", "tier": "web"}}},
        "status": {"readyReplicas": 1, "replicas": 2}
    }"#;

    #[test]
    fn reads_application_status() {
        let json = r#"{"status": {"sync": {"status": "Synced"}, "health": {"status": "Healthy"}}}"#;
        assert!(app_status(json).unwrap().is_converged());
    }

    #[test]
    fn unlisted_health_reads_unknown() {
        let json = r#"{"status": {"sync": {"status": "OutOfSync"}, "health": {"status": "Missing"}}}"#;
        let status = app_status(json).unwrap();
        assert_eq!(status.sync, SyncStatus::OutOfSync);
        assert_eq!(status.health, HealthStatus::Unknown);
    }

    #[test]
    fn application_without_status_is_unknown() {
        assert_eq!(app_status(r#"{"metadata": {"name": "grafana"}}"#).unwrap(), AppStatus::unknown());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(app_status("error: no context"), Err(RollguardError::Parse { .. })));
    }

    #[test]
    fn summarises_deployment() {
        let summary = workload_summary(DEPLOYMENT).unwrap();
        assert_eq!(
            summary,
            WorkloadSummary {
                desired: 2,
                ready: 1,
                selector: "app.kubernetes.io/name=grafana,tier=web".to_string(),
            }
        );
    }

    #[test]
    fn crash_loop_overrides_running_phase() {
        let summary = workload_summary(DEPLOYMENT).unwrap();
        let pods = r#"{"items": [
            {"status": {"phase": "Running", "containerStatuses": [{"restartCount": 1, "state": {"running": {}}}]}},
            {"status": {"phase": "Running", "containerStatuses": [
                {"restartCount": 7, "state": {"waiting": {"reason": "CrashLoopBackOff"}},
                 "lastState": {"terminated": {"reason": "Error"}}}
            ]}}
        ]}"#;

        let status = workload_status(&summary, pods).unwrap();

        assert_eq!(status.phase, WorkloadPhase::CrashLoopBackOff);
        assert_eq!(status.restarts, 7);
        assert_eq!((status.ready, status.desired), (1, 2));
    }

    #[test]
    fn past_crash_of_running_pod_is_not_crash_like() {
        let summary = workload_summary(DEPLOYMENT).unwrap();
        let pods = r#"{"items": [{"status": {"phase": "Running", "containerStatuses": [
            {"restartCount": 1, "ready": true, "state": {"running": {"startedAt": "2024-01-01T00:00:00Z"}},
             "lastState": {"terminated": {"reason": "Error", "exitCode": 1}}}
        ]}}]}"#;

        let status = workload_status(&summary, pods).unwrap();

        assert_eq!(status.phase, WorkloadPhase::Running);
        assert!(!status.phase.is_crash_like());
        assert_eq!(status.restarts, 1);
    }

    #[test]
    fn current_termination_reason_is_reported() {
        let summary = workload_summary(DEPLOYMENT).unwrap();
        let pods = r#"{"items": [{"status": {"phase": "Running", "containerStatuses": [
            {"restartCount": 2, "state": {"terminated": {"reason": "OOMKilled"}}}
        ]}}]}"#;

        assert_eq!(workload_status(&summary, pods).unwrap().phase, WorkloadPhase::OOMKilled);
    }

    #[test]
    fn no_pods_is_absent() {
        let summary = workload_summary(DEPLOYMENT).unwrap();
        let status = workload_status(&summary, r#"{"items": []}"#).unwrap();
        assert_eq!(status.phase, WorkloadPhase::Absent);
        assert_eq!(status.restarts, 0);
    }

    #[test]
    fn sanitize_strips_server_fields() {
        let exported = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: grafana
  namespace: monitoring
  uid: 1b2c
  resourceVersion: \"4711\"
  generation: 3
  creationTimestamp: \"2024-01-01T00:00:00Z\"
  annotations:
    kubectl.kubernetes.io/last-applied-configuration: \"{}\"
spec:
  replicas: 1
status:
  readyReplicas: 1
";
        let clean = sanitize_manifest(exported).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&clean).unwrap();

        assert!(doc.get("status").is_none());
        let metadata = &doc["metadata"];
        assert_eq!(metadata["name"].as_str(), Some("grafana"));
        for field in ["uid", "resourceVersion", "generation", "creationTimestamp", "annotations"] {
            assert!(metadata.get(field).is_none(), "{field} kept");
        }
        assert_eq!(doc["spec"]["replicas"].as_u64(), Some(1));
    }

    #[test]
    fn sanitize_keeps_other_annotations() {
        let exported = "\
kind: Deployment
metadata:
  name: grafana
  annotations:
    team: observability
    kubectl.kubernetes.io/last-applied-configuration: \"{}\"
";
        let doc: serde_yaml::Value = serde_yaml::from_str(&sanitize_manifest(exported).unwrap()).unwrap();
        assert_eq!(doc["metadata"]["annotations"]["team"].as_str(), Some("observability"));
        assert!(doc["metadata"]["annotations"].get(LAST_APPLIED).is_none());
    }

    #[test]
    fn decodes_secret() {
        assert_eq!(decode_secret("aHVudGVyMg==\n").unwrap(), "hunter2");
        assert!(decode_secret("").is_err());
        assert!(decode_secret("not base64!").is_err());
    }

    #[test]
    fn reads_user_info() {
        assert_eq!(
            logged_in_user(r#"{"loggedIn": true, "username": "admin", "iss": "argocd"}"#).unwrap(),
            Some("admin".to_string())
        );
        assert_eq!(logged_in_user(r#"{"loggedIn": false}"#).unwrap(), None);
    }

    #[test]
    fn reads_minted_token() {
        assert_eq!(minted_token("eyJhbGciOi.abc.def\n").unwrap(), "eyJhbGciOi.abc.def");
        assert!(minted_token("\n").is_err());
        assert!(minted_token("FATA[0000] rpc error\nsecond line").is_err());
    }
}
