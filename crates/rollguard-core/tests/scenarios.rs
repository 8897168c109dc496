//! End-to-end runs against scripted fakes, with one-second timers on a
//! paused clock.

use rollguard_core::{AuthStrategy, Orchestrator, PhaseOutcome, RunReport, TargetSpec, TargetStatus};
use rollguard_test_utils::{
    crashing, degraded_app, healthy_app, progressing_app, test_config, Harness,
};
use std::future::pending;
use std::path::Path;

fn target(name: &str) -> TargetSpec {
    TargetSpec::new(name, "apps")
}

async fn run(harness: &Harness, targets: Vec<TargetSpec>, backups: &Path) -> RunReport {
    Orchestrator::new(test_config(targets, backups), harness.ports())
        .run(pending())
        .await
}

fn phase(report: &RunReport, name: &str) -> Option<PhaseOutcome> {
    report
        .phases
        .iter()
        .rev()
        .find(|p| p.name == name)
        .map(|p| p.outcome)
}

#[tokio::test(start_paused = true)]
async fn two_targets_converge() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    harness.direct.script_status(
        "grafana",
        vec![progressing_app(), progressing_app(), progressing_app(), healthy_app()],
    );
    harness.direct.script_status("loki", vec![healthy_app()]);

    let started = tokio::time::Instant::now();
    let report = run(&harness, vec![target("grafana"), target("loki")], dir.path()).await;

    assert_eq!(report.exit_code(), 0);
    let statuses: Vec<TargetStatus> = report.targets.iter().map(|t| t.status).collect();
    assert_eq!(statuses, vec![TargetStatus::Success, TargetStatus::Success]);
    assert_eq!(report.targets[0].samples, 4);
    assert_eq!(report.targets[1].samples, 1);
    assert!(started.elapsed().as_secs() <= 20);
    assert_eq!(phase(&report, "sync:grafana"), Some(PhaseOutcome::Ok));
    assert_eq!(harness.client.sync_calls("grafana"), 1);
}

#[tokio::test(start_paused = true)]
async fn target_without_terminal_state_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    harness.direct.script_status("grafana", vec![progressing_app()]);

    let report = run(&harness, vec![target("grafana")], dir.path()).await;

    assert_eq!(report.exit_code(), 1);
    let t = &report.targets[0];
    assert_eq!(t.status, TargetStatus::Timeout);
    assert_eq!(t.elapsed_secs, 30);
    assert!(!t.rollback_invoked);
    assert_eq!(phase(&report, "monitor"), Some(PhaseOutcome::Warn));
}

#[tokio::test(start_paused = true)]
async fn crash_loop_rolls_back_on_third_sample() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    harness.direct.script_status("grafana", vec![degraded_app()]);
    harness.cluster.set_manifest("grafana", "kind: Deployment\nimage: v1\n", 1);
    harness.cluster.script_status("grafana", vec![crashing(0)]);

    let report = run(&harness, vec![target("grafana")], dir.path()).await;

    assert_eq!(report.exit_code(), 2);
    let t = &report.targets[0];
    assert_eq!(t.status, TargetStatus::RolledBack);
    assert_eq!(t.samples, 3);
    assert_eq!(t.consecutive_failures, 3);
    assert!(t.rollback_invoked);
    assert_eq!(
        harness.cluster.ops_for("grafana"),
        vec!["scale grafana 0", "apply grafana", "scale grafana 1"]
    );
    assert_eq!(
        harness.cluster.manifest("grafana").as_deref(),
        Some("kind: Deployment\nimage: v1\n")
    );
}

#[tokio::test(start_paused = true)]
async fn rollback_without_backup_is_unknown_for_that_target_only() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    harness.direct.script_status("grafana", vec![degraded_app()]);
    harness.direct.script_status("loki", vec![healthy_app()]);
    harness.cluster.script_status("grafana", vec![crashing(0)]);

    let report = run(&harness, vec![target("grafana"), target("loki")], dir.path()).await;

    assert_eq!(report.targets[0].status, TargetStatus::Unknown);
    assert!(report.targets[0]
        .error
        .as_deref()
        .unwrap()
        .contains("cannot roll back grafana"));
    assert_eq!(report.targets[1].status, TargetStatus::Success);
    assert_eq!(report.exit_code(), 1);
    assert!(harness.cluster.ops_for("grafana").is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_auth_chain_falls_back_to_direct_sync() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    harness.cluster.set_secret("argocd", "argocd-initial-admin-secret", "password", "hunter2\n");
    harness.auth.fail(&[
        AuthStrategy::CachedSession,
        AuthStrategy::CredentialLogin,
        AuthStrategy::MintedToken,
    ]);
    harness.direct.script_status("grafana", vec![progressing_app(), healthy_app()]);

    let report = run(&harness, vec![target("grafana")], dir.path()).await;

    assert_eq!(
        harness.auth.calls(),
        vec!["probe", "login admin", "mint admin"]
    );
    assert_eq!(harness.auth.passwords(), vec!["hunter2"]);
    assert_eq!(phase(&report, "auth"), Some(PhaseOutcome::Warn));
    assert_eq!(phase(&report, "sync:grafana"), Some(PhaseOutcome::Ok));
    assert_eq!(harness.client.sync_calls("grafana"), 0);
    assert_eq!(harness.direct.refresh_calls("grafana"), 1);
    assert!(harness.prompt.questions().is_empty());
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn minted_token_is_revoked_at_exit() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    harness.cluster.set_secret("argocd", "argocd-initial-admin-secret", "password", "stale");
    harness.auth.fail(&[AuthStrategy::CachedSession, AuthStrategy::CredentialLogin]);
    harness.direct.script_status("grafana", vec![healthy_app()]);

    let report = run(&harness, vec![target("grafana")], dir.path()).await;

    let calls = harness.auth.calls();
    assert_eq!(calls[..4], ["probe", "login admin", "mint admin", "use tok-1"]);
    assert_eq!(calls.last().map(String::as_str), Some("revoke tok-1"));
    assert_eq!(phase(&report, "cleanup:credentials"), Some(PhaseOutcome::Ok));
    assert_eq!(report.exit_code(), 0);
}
