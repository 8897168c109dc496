use proptest::prelude::*;
use rollguard_core::{
    AppStatus, Backup, FailureTracker, FileSnapshot, HealthMonitor, HealthSample, HealthStatus,
    LiveSnapshot, MonitorSettings, RetryPolicy, RollbackEngine, RunGuard, RunId, RunState, SyncStatus,
    Target, TargetSpec, TickVerdict, WorkloadPhase, WorkloadStatus,
};
use rollguard_test_utils::{FakeAuthClient, FakeCluster, ScriptedReconciler};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const RESTART_THRESHOLD: u32 = 5;

fn sync_status() -> impl Strategy<Value = SyncStatus> {
    prop_oneof![
        Just(SyncStatus::Synced),
        Just(SyncStatus::OutOfSync),
        Just(SyncStatus::Unknown),
    ]
}

fn health_status() -> impl Strategy<Value = HealthStatus> {
    prop_oneof![
        Just(HealthStatus::Healthy),
        Just(HealthStatus::Degraded),
        Just(HealthStatus::Progressing),
        Just(HealthStatus::Unknown),
    ]
}

fn calm_phase() -> impl Strategy<Value = WorkloadPhase> {
    prop_oneof![
        Just(WorkloadPhase::Running),
        Just(WorkloadPhase::Pending),
        Just(WorkloadPhase::Succeeded),
        Just(WorkloadPhase::Failed),
        Just(WorkloadPhase::Absent),
    ]
}

fn any_phase() -> impl Strategy<Value = WorkloadPhase> {
    prop_oneof![
        calm_phase(),
        Just(WorkloadPhase::CrashLoopBackOff),
        Just(WorkloadPhase::Error),
        Just(WorkloadPhase::OOMKilled),
    ]
}

fn sample_with(phase: impl Strategy<Value = WorkloadPhase>, max_restarts: u32) -> impl Strategy<Value = HealthSample> {
    (sync_status(), health_status(), phase, 0..=max_restarts).prop_map(|(sync, health, phase, restarts)| {
        HealthSample::from_signals(
            AppStatus::new(sync, health),
            WorkloadStatus {
                phase,
                ready: 0,
                desired: 1,
                restarts,
            },
        )
    })
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

fn backed_up_target(spec: TargetSpec, manifest: &str, replicas: u32) -> Target {
    let live = LiveSnapshot {
        manifest: manifest.to_string(),
        replicas,
    };
    let backup = Backup::new(spec.name.clone(), Vec::new(), Some(live));
    Target::new(Arc::new(spec)).with_backup(Some(Arc::new(backup)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn counter_follows_model(
        samples in prop::collection::vec(sample_with(any_phase(), 8), 1..40),
        threshold in 1u32..6,
    ) {
        let mut tracker = FailureTracker::new(threshold, RESTART_THRESHOLD);
        let mut model = 0u32;
        for sample in &samples {
            let verdict = tracker.observe(sample);
            if sample.is_fully_healthy() {
                model = 0;
                prop_assert_eq!(verdict, TickVerdict::Healthy);
            } else if sample.is_failure(RESTART_THRESHOLD) {
                model += 1;
                if model >= threshold {
                    prop_assert_eq!(verdict, TickVerdict::ThresholdReached);
                } else {
                    prop_assert_eq!(verdict, TickVerdict::Failing { consecutive: model });
                }
            } else {
                prop_assert_eq!(verdict, TickVerdict::Pending);
            }
            prop_assert_eq!(tracker.consecutive(), model);
        }
    }

    #[test]
    fn fully_healthy_sample_resets_counter(
        samples in prop::collection::vec(sample_with(any_phase(), 8), 0..20),
        phase in any_phase(),
        restarts in 0u32..20,
    ) {
        let mut tracker = FailureTracker::new(u32::MAX, RESTART_THRESHOLD);
        for sample in &samples {
            tracker.observe(sample);
        }
        let healthy = HealthSample::from_signals(
            AppStatus::new(SyncStatus::Synced, HealthStatus::Healthy),
            WorkloadStatus { phase, ready: 1, desired: 1, restarts },
        );
        prop_assert_eq!(tracker.observe(&healthy), TickVerdict::Healthy);
        prop_assert_eq!(tracker.consecutive(), 0);
    }

    #[test]
    fn backoff_delay_doubles(base_secs in 1u64..60, attempt in 1u32..8) {
        let policy = RetryPolicy::new(Duration::from_secs(base_secs), 8);
        let expected = Duration::from_secs(base_secs * 2u64.pow(attempt - 1));
        prop_assert_eq!(policy.delay_for(attempt), expected);
    }

    #[test]
    fn uncommitted_backups_restore_byte_for_byte(
        files in prop::collection::vec(
            (prop::collection::vec(any::<u8>(), 0..256), prop::collection::vec(any::<u8>(), 0..256)),
            1..5,
        ),
        committed in any::<bool>(),
    ) {
        let work = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        let state = Arc::new(RunState::new(RunId::new(), mirror.path().to_path_buf(), false));

        let mut paths = Vec::new();
        for (i, (original, _)) in files.iter().enumerate() {
            let path = work.path().join(format!("values-{i}.yaml"));
            std::fs::write(&path, original).unwrap();
            let backup = Backup::new(format!("t{i}"), vec![FileSnapshot::capture(&path).unwrap()], None);
            state.store.insert(backup);
            paths.push(path);
        }
        for (path, (_, mutated)) in paths.iter().zip(&files) {
            std::fs::write(path, mutated).unwrap();
        }
        state.committed.store(committed, Ordering::SeqCst);

        // Dropped without finish, as on a panic or an aborted future.
        drop(RunGuard::new(Arc::clone(&state), Arc::new(FakeAuthClient::new()), "admin", None));

        for (path, (original, mutated)) in paths.iter().zip(&files) {
            let on_disk = std::fs::read(path).unwrap();
            if committed {
                prop_assert_eq!(&on_disk, mutated);
            } else {
                prop_assert_eq!(&on_disk, original);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn no_crash_means_no_rollback(
        apps in prop::collection::vec((sync_status(), health_status()), 1..15),
        workloads in prop::collection::vec((calm_phase(), 0..=RESTART_THRESHOLD), 1..15),
    ) {
        let cluster = Arc::new(FakeCluster::new());
        let direct = Arc::new(ScriptedReconciler::new("direct"));
        direct.script_status("web", apps.iter().map(|(s, h)| AppStatus::new(*s, *h)).collect());
        cluster.script_status(
            "web",
            workloads
                .iter()
                .map(|(phase, restarts)| WorkloadStatus { phase: phase.clone(), ready: 0, desired: 1, restarts: *restarts })
                .collect(),
        );

        let monitor = HealthMonitor::new(
            direct,
            cluster.clone(),
            RollbackEngine::new(cluster.clone(), RetryPolicy::none(), Duration::from_secs(1)),
            MonitorSettings {
                duration: Duration::from_secs(20),
                interval: Duration::from_secs(1),
                rollback_threshold: 1,
                restart_threshold: RESTART_THRESHOLD,
                skip_secondary: false,
            },
        );
        let target = backed_up_target(TargetSpec::new("web", "apps"), "kind: Deployment\n", 1);
        let report = runtime().block_on(monitor.monitor_target(target));

        prop_assert!(!report.rollback_invoked);
        prop_assert_eq!(report.consecutive_failures, 0);
        prop_assert!(cluster.ops().is_empty());
    }

    #[test]
    fn rollback_is_idempotent(
        manifest in "[a-z: \n]{1,64}",
        replicas in 0u32..5,
    ) {
        let spec = TargetSpec::new("web", "apps");
        let backup = Backup::new("web", Vec::new(), Some(LiveSnapshot { manifest: manifest.clone(), replicas }));

        let once = Arc::new(FakeCluster::new());
        once.set_manifest("web", "kind: Deployment\nimage: broken\n", 3);
        let twice = Arc::new(FakeCluster::new());
        twice.set_manifest("web", "kind: Deployment\nimage: broken\n", 3);

        runtime().block_on(async {
            let engine = RollbackEngine::new(once.clone(), RetryPolicy::none(), Duration::from_secs(1));
            engine.rollback(&spec, Some(&backup)).await.unwrap();

            let engine = RollbackEngine::new(twice.clone(), RetryPolicy::none(), Duration::from_secs(1));
            engine.rollback(&spec, Some(&backup)).await.unwrap();
            engine.rollback(&spec, Some(&backup)).await.unwrap();
        });

        prop_assert_eq!(once.manifest("web"), twice.manifest("web"));
        prop_assert_eq!(once.replicas("web"), twice.replicas("web"));
        prop_assert_eq!(once.manifest("web"), Some(manifest));
        prop_assert_eq!(once.replicas("web"), Some(replicas));
    }
}
