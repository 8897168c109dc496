//! Testing utilities for the rollguard workspace
//!
//! Scripted fakes for every port, plus a [`Harness`] that wires them into
//! [`Ports`] and a fast [`test_config`].

#![allow(missing_docs)]

use parking_lot::Mutex;
use rollguard_core::{
    AppStatus, AuthClient, AuthStrategy, ClusterProbe, ConfigTransform, HealthStatus, MintedToken,
    OperatorPrompt, Ports, ReconcilerBackend, Repository, Result, RetryPolicy, RunConfig, SecretStore,
    SyncStatus, TargetSpec, ToolInventory, RollguardError, WorkloadPhase, WorkloadStatus, Workloads,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Kind of error a fake should produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    Auth,
    Transient,
    Command,
}

impl FailKind {
    pub fn error(self, operation: &str) -> RollguardError {
        match self {
            Self::Auth => RollguardError::Auth(format!("{operation}: Unauthenticated")),
            Self::Transient => RollguardError::transient(operation, "connection refused"),
            Self::Command => RollguardError::Command {
                program: "fake".to_string(),
                status: "exit status: 1".to_string(),
                stderr: format!("{operation} failed"),
            },
        }
    }
}

pub fn app(sync: SyncStatus, health: HealthStatus) -> AppStatus {
    AppStatus::new(sync, health)
}

pub fn healthy_app() -> AppStatus {
    app(SyncStatus::Synced, HealthStatus::Healthy)
}

pub fn degraded_app() -> AppStatus {
    app(SyncStatus::Synced, HealthStatus::Degraded)
}

pub fn progressing_app() -> AppStatus {
    app(SyncStatus::OutOfSync, HealthStatus::Progressing)
}

pub fn running(ready: u32, desired: u32) -> WorkloadStatus {
    WorkloadStatus {
        phase: WorkloadPhase::Running,
        ready,
        desired,
        restarts: 0,
    }
}

pub fn crashing(restarts: u32) -> WorkloadStatus {
    WorkloadStatus {
        phase: WorkloadPhase::CrashLoopBackOff,
        ready: 0,
        desired: 1,
        restarts,
    }
}

/// Sequence of values; the last one repeats forever
#[derive(Debug, Clone)]
struct Script<T> {
    values: Vec<T>,
    calls: usize,
}

impl<T: Clone> Script<T> {
    fn new(values: Vec<T>) -> Self {
        Self { values, calls: 0 }
    }

    fn next(&mut self) -> Option<T> {
        let value = self
            .values
            .get(self.calls.min(self.values.len().saturating_sub(1)))
            .cloned();
        self.calls += 1;
        value
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    unreachable: bool,
    statuses: HashMap<String, Script<WorkloadStatus>>,
    manifests: HashMap<String, String>,
    replicas: HashMap<String, u32>,
    exec_output: HashMap<String, String>,
    logs: HashMap<String, String>,
    secrets: HashMap<(String, String, String), String>,
    scale_failures: u32,
    panicking: HashSet<String>,
    ops: Vec<String>,
}

/// In-memory cluster: probe, secret store and workloads
///
/// Workload status scripts advance on every `status` call, including the
/// one the applier makes to capture replica counts.
#[derive(Debug, Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn script_status(&self, target: &str, statuses: Vec<WorkloadStatus>) {
        self.state
            .lock()
            .statuses
            .insert(target.to_string(), Script::new(statuses));
    }

    /// Make `status` panic for `target`
    pub fn panic_on_status(&self, target: &str) {
        self.state.lock().panicking.insert(target.to_string());
    }

    pub fn set_manifest(&self, target: &str, manifest: &str, replicas: u32) {
        let mut state = self.state.lock();
        state.manifests.insert(target.to_string(), manifest.to_string());
        state.replicas.insert(target.to_string(), replicas);
    }

    pub fn set_exec_output(&self, target: &str, output: &str) {
        self.state
            .lock()
            .exec_output
            .insert(target.to_string(), output.to_string());
    }

    pub fn set_logs(&self, target: &str, logs: &str) {
        self.state.lock().logs.insert(target.to_string(), logs.to_string());
    }

    pub fn set_secret(&self, namespace: &str, name: &str, key: &str, value: &str) {
        self.state.lock().secrets.insert(
            (namespace.to_string(), name.to_string(), key.to_string()),
            value.to_string(),
        );
    }

    /// Make the next `n` scale calls fail transiently
    pub fn fail_next_scales(&self, n: u32) {
        self.state.lock().scale_failures = n;
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    pub fn ops_for(&self, target: &str) -> Vec<String> {
        let suffix = format!(" {target}");
        self.ops()
            .into_iter()
            .filter(|op| op.contains(&suffix))
            .collect()
    }

    pub fn manifest(&self, target: &str) -> Option<String> {
        self.state.lock().manifests.get(target).cloned()
    }

    pub fn replicas(&self, target: &str) -> Option<u32> {
        self.state.lock().replicas.get(target).copied()
    }

    pub fn status_calls(&self, target: &str) -> usize {
        self.state
            .lock()
            .statuses
            .get(target)
            .map_or(0, |s| s.calls)
    }
}

#[async_trait::async_trait]
impl ClusterProbe for FakeCluster {
    async fn ping(&self) -> Result<()> {
        if self.state.lock().unreachable {
            Err(RollguardError::transient("cluster-info", "connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl SecretStore for FakeCluster {
    async fn read_secret(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        self.state
            .lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| FailKind::Command.error(&format!("get secret {namespace}/{name}")))
    }
}

#[async_trait::async_trait]
impl Workloads for FakeCluster {
    async fn scale(&self, target: &TargetSpec, replicas: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.scale_failures > 0 {
            state.scale_failures -= 1;
            return Err(FailKind::Transient.error("scale"));
        }
        state.ops.push(format!("scale {} {}", target.name, replicas));
        state.replicas.insert(target.name.clone(), replicas);
        Ok(())
    }

    async fn status(&self, target: &TargetSpec) -> Result<WorkloadStatus> {
        let mut state = self.state.lock();
        if state.panicking.contains(&target.name) {
            drop(state);
            panic!("status of {} blew up", target.name);
        }
        match state.statuses.get_mut(&target.name).and_then(Script::next) {
            Some(status) => Ok(status),
            None => Ok(running(1, 1)),
        }
    }

    async fn exec(&self, target: &TargetSpec, command: &[&str]) -> Result<String> {
        let mut state = self.state.lock();
        state.ops.push(format!("exec {} {}", target.name, command.join(" ")));
        state
            .exec_output
            .get(&target.name)
            .cloned()
            .ok_or_else(|| FailKind::Command.error("exec"))
    }

    async fn export_manifest(&self, target: &TargetSpec) -> Result<String> {
        self.state
            .lock()
            .manifests
            .get(&target.name)
            .cloned()
            .ok_or_else(|| FailKind::Command.error(&format!("get {}", target.workload_ref())))
    }

    async fn apply_manifest(&self, target: &TargetSpec, manifest: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(format!("apply {}", target.name));
        state.manifests.insert(target.name.clone(), manifest.to_string());
        Ok(())
    }

    async fn logs(&self, target: &TargetSpec, _tail: u32) -> Result<String> {
        self.state
            .lock()
            .logs
            .get(&target.name)
            .cloned()
            .ok_or_else(|| FailKind::Command.error("logs"))
    }
}

#[derive(Debug, Default)]
struct ReconcilerState {
    statuses: HashMap<String, Script<AppStatus>>,
    sync_failures: HashMap<String, (u32, FailKind)>,
    refresh_failures: u32,
    sync_calls: HashMap<String, u32>,
    refresh_calls: HashMap<String, u32>,
}

/// Reconciler backend with per-application scripted status
#[derive(Debug)]
pub struct ScriptedReconciler {
    name: &'static str,
    state: Mutex<ReconcilerState>,
}

impl ScriptedReconciler {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(ReconcilerState::default()),
        }
    }

    pub fn script_status(&self, app: &str, statuses: Vec<AppStatus>) {
        self.state
            .lock()
            .statuses
            .insert(app.to_string(), Script::new(statuses));
    }

    /// Fail the next `times` sync requests for `app`
    pub fn fail_sync(&self, app: &str, times: u32, kind: FailKind) {
        self.state
            .lock()
            .sync_failures
            .insert(app.to_string(), (times, kind));
    }

    /// Fail every sync request for `app`
    pub fn fail_sync_always(&self, app: &str, kind: FailKind) {
        self.fail_sync(app, u32::MAX, kind);
    }

    pub fn fail_next_refreshes(&self, times: u32) {
        self.state.lock().refresh_failures = times;
    }

    pub fn sync_calls(&self, app: &str) -> u32 {
        self.state.lock().sync_calls.get(app).copied().unwrap_or(0)
    }

    pub fn refresh_calls(&self, app: &str) -> u32 {
        self.state.lock().refresh_calls.get(app).copied().unwrap_or(0)
    }

    pub fn status_calls(&self, app: &str) -> usize {
        self.state.lock().statuses.get(app).map_or(0, |s| s.calls)
    }
}

#[async_trait::async_trait]
impl ReconcilerBackend for ScriptedReconciler {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn request_sync(&self, app: &str) -> Result<()> {
        let mut state = self.state.lock();
        *state.sync_calls.entry(app.to_string()).or_default() += 1;
        if let Some((remaining, kind)) = state.sync_failures.get_mut(app) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(kind.error(&format!("sync {app}")));
            }
        }
        Ok(())
    }

    async fn app_status(&self, app: &str) -> Result<AppStatus> {
        self.state
            .lock()
            .statuses
            .get_mut(app)
            .and_then(Script::next)
            .ok_or_else(|| FailKind::Transient.error(&format!("get application {app}")))
    }

    async fn hard_refresh(&self, app: &str) -> Result<()> {
        let mut state = self.state.lock();
        *state.refresh_calls.entry(app.to_string()).or_default() += 1;
        if state.refresh_failures > 0 {
            state.refresh_failures -= 1;
            return Err(FailKind::Transient.error("refresh"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AuthState {
    failing: HashSet<AuthStrategy>,
    hang: HashSet<AuthStrategy>,
    calls: Vec<String>,
    passwords: Vec<String>,
    minted: u32,
}

/// Auth client whose strategies can be forced to fail or hang
#[derive(Debug, Default)]
pub struct FakeAuthClient {
    state: Mutex<AuthState>,
}

impl FakeAuthClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, strategies: &[AuthStrategy]) {
        self.state.lock().failing.extend(strategies.iter().copied());
    }

    pub fn recover(&self, strategy: AuthStrategy) {
        self.state.lock().failing.remove(&strategy);
    }

    /// Make `strategy` never answer
    pub fn hang(&self, strategy: AuthStrategy) {
        self.state.lock().hang.insert(strategy);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn passwords(&self) -> Vec<String> {
        self.state.lock().passwords.clone()
    }

    fn enter(&self, strategy: AuthStrategy, call: String) -> (bool, bool) {
        let mut state = self.state.lock();
        state.calls.push(call);
        (state.hang.contains(&strategy), state.failing.contains(&strategy))
    }

    async fn outcome(&self, strategy: AuthStrategy, call: &str) -> Result<()> {
        let (hang, fail) = self.enter(strategy, call.to_string());
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(FailKind::Auth.error(call));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuthClient for FakeAuthClient {
    async fn probe_session(&self) -> Result<()> {
        self.outcome(AuthStrategy::CachedSession, "probe").await
    }

    async fn login(&self, username: &str, password: &str) -> Result<()> {
        self.state.lock().passwords.push(password.to_string());
        self.outcome(AuthStrategy::CredentialLogin, &format!("login {username}"))
            .await
    }

    async fn mint_token(&self, account: &str) -> Result<MintedToken> {
        self.outcome(AuthStrategy::MintedToken, &format!("mint {account}"))
            .await?;
        let mut state = self.state.lock();
        state.minted += 1;
        Ok(MintedToken {
            id: format!("tok-{}", state.minted),
            secret: format!("secret-{}", state.minted),
        })
    }

    async fn use_token(&self, token: &MintedToken) -> Result<()> {
        self.state.lock().calls.push(format!("use {}", token.id));
        Ok(())
    }

    async fn revoke_token(&self, _account: &str, token_id: &str) -> Result<()> {
        self.state.lock().calls.push(format!("revoke {token_id}"));
        Ok(())
    }
}

#[derive(Debug)]
struct RepoState {
    branch: String,
    commits: Vec<(Vec<PathBuf>, String)>,
    fail_commit: bool,
    hang_commit: bool,
}

/// Repository that records commits instead of running git
#[derive(Debug)]
pub struct FakeRepository {
    state: Mutex<RepoState>,
}

impl FakeRepository {
    pub fn on_branch(branch: &str) -> Self {
        Self {
            state: Mutex::new(RepoState {
                branch: branch.to_string(),
                commits: Vec::new(),
                fail_commit: false,
                hang_commit: false,
            }),
        }
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.state.lock().fail_commit = fail;
    }

    /// Make commits never return
    pub fn set_hang_commit(&self, hang: bool) {
        self.state.lock().hang_commit = hang;
    }

    pub fn branch(&self) -> String {
        self.state.lock().branch.clone()
    }

    pub fn commits(&self) -> Vec<(Vec<PathBuf>, String)> {
        self.state.lock().commits.clone()
    }
}

#[async_trait::async_trait]
impl Repository for FakeRepository {
    async fn current_branch(&self) -> Result<String> {
        Ok(self.branch())
    }

    async fn checkout(&self, branch: &str) -> Result<()> {
        self.state.lock().branch = branch.to_string();
        Ok(())
    }

    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<String> {
        let (hang, fail) = {
            let state = self.state.lock();
            (state.hang_commit, state.fail_commit)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(FailKind::Command.error("git commit"));
        }
        let mut state = self.state.lock();
        state.commits.push((paths.to_vec(), message.to_string()));
        Ok(format!("c0ffee{}", state.commits.len()))
    }
}

type TransformFn = dyn Fn(&Path) -> Result<()> + Send + Sync;

/// Transform backed by a closure
pub struct FnTransform {
    f: Box<TransformFn>,
}

impl FnTransform {
    pub fn new(f: impl Fn(&Path) -> Result<()> + Send + Sync + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    /// Leaves files untouched
    pub fn noop() -> Self {
        Self::new(|_| Ok(()))
    }

    /// Appends `text` to every file
    pub fn append(text: &'static str) -> Self {
        Self::new(move |path| {
            let mut body = std::fs::read_to_string(path).map_err(|e| RollguardError::io(path, e))?;
            body.push_str(text);
            std::fs::write(path, body).map_err(|e| RollguardError::io(path, e))
        })
    }

    /// Corrupts the file, then fails
    pub fn corrupt_then_fail() -> Self {
        Self::new(|path| {
            std::fs::write(path, b"garbage").map_err(|e| RollguardError::io(path, e))?;
            Err(RollguardError::Apply(format!("transform crashed on {}", path.display())))
        })
    }
}

impl std::fmt::Debug for FnTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnTransform")
    }
}

#[async_trait::async_trait]
impl ConfigTransform for FnTransform {
    async fn transform(&self, path: &Path) -> Result<()> {
        (self.f)(path)
    }
}

/// Fixed tool inventory
#[derive(Debug, Clone)]
pub struct StaticTools(HashSet<String>);

impl StaticTools {
    pub fn all() -> Self {
        Self::only(&["kubectl", "git", "argocd"])
    }

    pub fn only(tools: &[&str]) -> Self {
        Self(tools.iter().map(|t| (*t).to_string()).collect())
    }
}

impl ToolInventory for StaticTools {
    fn has(&self, tool: &str) -> bool {
        self.0.contains(tool)
    }
}

/// Prompt that answers from a queue, then a default
#[derive(Debug)]
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<bool>>,
    default: bool,
    questions: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn always(answer: bool) -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            default: answer,
            questions: Mutex::new(Vec::new()),
        }
    }

    pub fn answers(answers: &[bool], default: bool) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            default,
            questions: Mutex::new(Vec::new()),
        }
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().clone()
    }
}

#[async_trait::async_trait]
impl OperatorPrompt for ScriptedPrompt {
    async fn confirm(&self, question: &str) -> bool {
        self.questions.lock().push(question.to_string());
        self.answers.lock().pop_front().unwrap_or(self.default)
    }
}

/// Every fake, wired together
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub client: Arc<ScriptedReconciler>,
    pub direct: Arc<ScriptedReconciler>,
    pub auth: Arc<FakeAuthClient>,
    pub repo: Arc<FakeRepository>,
    pub transform: Arc<FnTransform>,
    pub tools: Arc<StaticTools>,
    pub prompt: Arc<ScriptedPrompt>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            cluster: Arc::new(FakeCluster::new()),
            client: Arc::new(ScriptedReconciler::new("argocd")),
            direct: Arc::new(ScriptedReconciler::new("direct")),
            auth: Arc::new(FakeAuthClient::new()),
            repo: Arc::new(FakeRepository::on_branch("dev")),
            transform: Arc::new(FnTransform::noop()),
            tools: Arc::new(StaticTools::all()),
            prompt: Arc::new(ScriptedPrompt::always(false)),
        }
    }

    pub fn with_transform(mut self, transform: FnTransform) -> Self {
        self.transform = Arc::new(transform);
        self
    }

    pub fn with_tools(mut self, tools: StaticTools) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn with_prompt(mut self, prompt: ScriptedPrompt) -> Self {
        self.prompt = Arc::new(prompt);
        self
    }

    pub fn with_repo(mut self, repo: FakeRepository) -> Self {
        self.repo = Arc::new(repo);
        self
    }

    pub fn ports(&self) -> Ports {
        Ports {
            probe: self.cluster.clone(),
            tools: self.tools.clone(),
            repo: self.repo.clone(),
            transform: self.transform.clone(),
            secrets: self.cluster.clone(),
            client: self.client.clone(),
            direct: self.direct.clone(),
            auth: self.auth.clone(),
            workloads: self.cluster.clone(),
            prompt: self.prompt.clone(),
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration with one-second timers for `start_paused` tests
pub fn test_config(targets: Vec<TargetSpec>, backup_dir: &Path) -> RunConfig {
    let mut config = RunConfig::default()
        .with_targets(targets)
        .with_monitoring(Duration::from_secs(30), Duration::from_secs(1))
        .with_retry(RetryPolicy::new(Duration::from_secs(1), 3))
        .with_backup_dir(backup_dir);
    config.sync_timeout = Duration::from_secs(10);
    config.sync_interval = Duration::from_secs(1);
    config.refresh_reissue_after = Duration::from_secs(3);
    config.settle_delay = Duration::from_secs(1);
    config.auth_timeout = Duration::from_secs(5);
    config
}
