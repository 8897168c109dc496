//! Run configuration
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `ROLLGUARD_*` environment variables, then CLI flags (applied by the
//! binary through the `with_*` builders).

use crate::error::{Result, RollguardError};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ROLLGUARD_";

/// How the operator is involved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Nobody is watching; never prompt
    #[default]
    Unattended,
    /// Operator may be asked to confirm
    Interactive,
}

/// One configured remediable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Target name
    pub name: String,
    /// Reconciler application name (defaults to `name`)
    #[serde(default)]
    pub app: Option<String>,
    /// Namespace of the workload
    pub namespace: String,
    /// Workload reference such as `deployment/grafana` (defaults to `deployment/<name>`)
    #[serde(default)]
    pub workload: Option<String>,
    /// Repository files the transform mutates
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Confirm the workload runs as a non-root identity
    #[serde(default)]
    pub check_identity: bool,
    /// Exact uid expected inside the workload
    #[serde(default)]
    pub expected_uid: Option<u32>,
    /// Scan workload logs for TLS/certificate errors before declaring success
    #[serde(default)]
    pub log_scan: bool,
}

impl TargetSpec {
    /// Create new target spec
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            app: None,
            namespace: namespace.into(),
            workload: None,
            files: Vec::new(),
            check_identity: false,
            expected_uid: None,
            log_scan: false,
        }
    }

    /// Reconciler application name
    #[inline]
    #[must_use]
    pub fn app_name(&self) -> &str {
        self.app.as_deref().unwrap_or(&self.name)
    }

    /// Workload reference
    #[must_use]
    pub fn workload_ref(&self) -> String {
        self.workload
            .clone()
            .unwrap_or_else(|| format!("deployment/{}", self.name))
    }

    /// With files
    #[inline]
    #[must_use]
    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }

    /// With application name
    #[inline]
    #[must_use]
    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    /// With workload reference
    #[inline]
    #[must_use]
    pub fn with_workload(mut self, workload: impl Into<String>) -> Self {
        self.workload = Some(workload.into());
        self
    }

    /// With identity check
    #[inline]
    #[must_use]
    pub fn with_identity_check(mut self, expected_uid: Option<u32>) -> Self {
        self.check_identity = true;
        self.expected_uid = expected_uid;
        self
    }

    /// With log scan
    #[inline]
    #[must_use]
    pub fn with_log_scan(mut self, enabled: bool) -> Self {
        self.log_scan = enabled;
        self
    }
}

/// Where the reconciler keeps its admin credentials and API server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerSettings {
    /// Namespace the reconciler runs in (also holds Application objects)
    pub namespace: String,
    /// Secret holding the initial admin password
    pub secret_name: String,
    /// Key inside the secret
    pub secret_key: String,
    /// Login user
    pub username: String,
    /// Account tokens are minted for
    pub token_account: String,
    /// API server address (client default when absent)
    pub server: Option<String>,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            namespace: "argocd".to_string(),
            secret_name: "argocd-initial-admin-secret".to_string(),
            secret_key: "password".to_string(),
            username: "admin".to_string(),
            token_account: "admin".to_string(),
            server: None,
        }
    }
}

/// Configuration for one rollguard run
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Operator involvement
    pub mode: RunMode,
    /// Run the transform, report the diff, restore and stop
    pub dry_run: bool,
    /// Skip the sync trigger
    pub skip_deploy: bool,
    /// Skip secondary checks in the health monitor
    pub skip_secondary: bool,
    /// Verbose console logging
    pub verbose: bool,
    /// Targets to remediate
    pub targets: Vec<TargetSpec>,
    /// Consecutive failures that trigger rollback
    pub rollback_threshold: u32,
    /// Monitoring window per target
    pub monitor_duration: Duration,
    /// Health poll interval
    pub poll_interval: Duration,
    /// Restart count above which a sample counts as failing
    pub restart_threshold: u32,
    /// Backoff for transient failures
    pub retry: RetryPolicy,
    /// Direct sync poll timeout
    pub sync_timeout: Duration,
    /// Direct sync poll interval
    pub sync_interval: Duration,
    /// Re-issue the refresh once if still out of sync after this long
    pub refresh_reissue_after: Duration,
    /// Pause between scale-down and re-apply during rollback
    pub settle_delay: Duration,
    /// Per-strategy auth timeout
    pub auth_timeout: Duration,
    /// Branch remediation commits go to
    pub expected_branch: String,
    /// Repository root
    pub repo_root: PathBuf,
    /// Transform command; `{file}` is replaced by each target file
    pub transform_command: Option<String>,
    /// Commit message for remediation commits
    pub commit_message: String,
    /// Reconciler settings
    pub reconciler: ReconcilerSettings,
    /// Where backups and the execution log are written
    pub backup_dir: PathBuf,
    /// kubectl context
    pub kube_context: Option<String>,
    /// Log lines scanned by verify and the log-scan check
    pub log_tail: u32,
}

impl RunConfig {
    /// Load defaults, then the TOML file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| RollguardError::io(path, e))?;
        Self::default().merge_toml(&raw)
    }

    /// Merge TOML text over this configuration
    pub fn merge_toml(self, raw: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(raw).map_err(|e| RollguardError::Config(format!("invalid config file: {e}")))?;
        Ok(file.apply(self))
    }

    /// Apply `ROLLGUARD_*` variables from the process environment
    pub fn apply_process_env(self) -> Result<Self> {
        self.apply_env(std::env::vars())
    }

    /// Apply `ROLLGUARD_*` variables from `vars`
    pub fn apply_env<I>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "ROLLBACK_THRESHOLD" => self.rollback_threshold = parse_env(&key, &value)?,
                "MONITOR_DURATION" => self.monitor_duration = secs(parse_env(&key, &value)?),
                "POLL_INTERVAL" => self.poll_interval = secs(parse_env(&key, &value)?),
                "RETRY_BASE" => self.retry.base = secs(parse_env(&key, &value)?),
                "RETRY_MAX" => self.retry.max_attempts = parse_env(&key, &value)?,
                "RESTART_THRESHOLD" => self.restart_threshold = parse_env(&key, &value)?,
                "SYNC_TIMEOUT" => self.sync_timeout = secs(parse_env(&key, &value)?),
                "EXPECTED_BRANCH" => self.expected_branch = value,
                "BACKUP_DIR" => self.backup_dir = PathBuf::from(value),
                "ARGOCD_SERVER" => self.reconciler.server = Some(value),
                "KUBE_CONTEXT" => self.kube_context = Some(value),
                _ => {}
            }
        }
        Ok(self)
    }

    /// Check thresholds and target list
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(RollguardError::Config("no targets configured".to_string()));
        }
        if self.rollback_threshold == 0 {
            return Err(RollguardError::Config("rollback threshold must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(RollguardError::Config("retry max must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(RollguardError::Config("poll interval must be positive".to_string()));
        }
        if self.poll_interval > self.monitor_duration {
            return Err(RollguardError::Config(format!(
                "poll interval {:?} exceeds monitor duration {:?}",
                self.poll_interval, self.monitor_duration
            )));
        }
        if self.sync_interval.is_zero() {
            return Err(RollguardError::Config("sync interval must be positive".to_string()));
        }
        if let Some(bad) = self.targets.iter().find(|t| !is_plain_name(&t.name)) {
            return Err(RollguardError::Config(format!(
                "target name {:?} must be a plain name without path separators",
                bad.name
            )));
        }
        let mut names: Vec<&str> = self.targets.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(RollguardError::Config(format!("duplicate target {}", dup[0])));
        }
        Ok(())
    }

    /// With mode
    #[inline]
    #[must_use]
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// With dry run
    #[inline]
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// With skip deploy
    #[inline]
    #[must_use]
    pub fn with_skip_deploy(mut self, skip: bool) -> Self {
        self.skip_deploy = skip;
        self
    }

    /// With skip secondary
    #[inline]
    #[must_use]
    pub fn with_skip_secondary(mut self, skip: bool) -> Self {
        self.skip_secondary = skip;
        self
    }

    /// With verbose
    #[inline]
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// With targets
    #[inline]
    #[must_use]
    pub fn with_targets(mut self, targets: Vec<TargetSpec>) -> Self {
        self.targets = targets;
        self
    }

    /// With monitoring window and poll interval
    #[inline]
    #[must_use]
    pub fn with_monitoring(mut self, duration: Duration, interval: Duration) -> Self {
        self.monitor_duration = duration;
        self.poll_interval = interval;
        self
    }

    /// With rollback threshold
    #[inline]
    #[must_use]
    pub fn with_rollback_threshold(mut self, threshold: u32) -> Self {
        self.rollback_threshold = threshold;
        self
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// With backup directory
    #[inline]
    #[must_use]
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    /// With kube context
    #[inline]
    #[must_use]
    pub fn with_kube_context(mut self, context: Option<String>) -> Self {
        self.kube_context = context;
        self
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Unattended,
            dry_run: false,
            skip_deploy: false,
            skip_secondary: false,
            verbose: false,
            targets: Vec::new(),
            rollback_threshold: 3,
            monitor_duration: Duration::from_secs(600),
            poll_interval: Duration::from_secs(10),
            restart_threshold: 5,
            retry: RetryPolicy::default(),
            sync_timeout: Duration::from_secs(300),
            sync_interval: Duration::from_secs(10),
            refresh_reissue_after: Duration::from_secs(30),
            settle_delay: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(30),
            expected_branch: "dev".to_string(),
            repo_root: PathBuf::from("."),
            transform_command: None,
            commit_message: "rollguard: apply remediation".to_string(),
            reconciler: ReconcilerSettings::default(),
            backup_dir: PathBuf::from(".rollguard"),
            kube_context: None,
            log_tail: 50,
        }
    }
}

#[inline]
fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RollguardError::Config(format!("{key}: cannot parse {value:?}")))
}

/// On-disk TOML layout; durations are in seconds
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    mode: Option<RunMode>,
    rollback_threshold: Option<u32>,
    monitor_duration: Option<u64>,
    poll_interval: Option<u64>,
    restart_threshold: Option<u32>,
    retry_base: Option<u64>,
    retry_max: Option<u32>,
    sync_timeout: Option<u64>,
    sync_interval: Option<u64>,
    refresh_reissue_after: Option<u64>,
    settle_delay: Option<u64>,
    auth_timeout: Option<u64>,
    expected_branch: Option<String>,
    repo_root: Option<PathBuf>,
    transform_command: Option<String>,
    commit_message: Option<String>,
    backup_dir: Option<PathBuf>,
    kube_context: Option<String>,
    log_tail: Option<u32>,
    argocd: Option<FileReconciler>,
    #[serde(default)]
    targets: Vec<TargetSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileReconciler {
    namespace: Option<String>,
    secret_name: Option<String>,
    secret_key: Option<String>,
    username: Option<String>,
    token_account: Option<String>,
    server: Option<String>,
}

impl FileConfig {
    fn apply(self, mut config: RunConfig) -> RunConfig {
        let file = self;
        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = file.$field {
                    config.$field = v;
                }
            };
            ($field:ident, secs) => {
                if let Some(v) = file.$field {
                    config.$field = secs(v);
                }
            };
        }

        take!(mode);
        take!(rollback_threshold);
        take!(monitor_duration, secs);
        take!(poll_interval, secs);
        take!(restart_threshold);
        take!(sync_timeout, secs);
        take!(sync_interval, secs);
        take!(refresh_reissue_after, secs);
        take!(settle_delay, secs);
        take!(auth_timeout, secs);
        take!(expected_branch);
        take!(repo_root);
        take!(commit_message);
        take!(backup_dir);
        take!(log_tail);
        if let Some(base) = file.retry_base {
            config.retry.base = secs(base);
        }
        if let Some(max) = file.retry_max {
            config.retry.max_attempts = max;
        }
        if file.transform_command.is_some() {
            config.transform_command = file.transform_command;
        }
        if file.kube_context.is_some() {
            config.kube_context = file.kube_context;
        }
        if let Some(argo) = file.argocd {
            let r = &mut config.reconciler;
            if let Some(v) = argo.namespace {
                r.namespace = v;
            }
            if let Some(v) = argo.secret_name {
                r.secret_name = v;
            }
            if let Some(v) = argo.secret_key {
                r.secret_key = v;
            }
            if let Some(v) = argo.username {
                r.username = v;
            }
            if let Some(v) = argo.token_account {
                r.token_account = v;
            }
            if argo.server.is_some() {
                r.server = argo.server;
            }
        }
        if !file.targets.is_empty() {
            config.targets = file.targets;
        }
        config
    }
}

/// Target names become directory names under the backup root
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_target() -> RunConfig {
        RunConfig::default().with_targets(vec![TargetSpec::new("grafana", "monitoring")])
    }

    #[test]
    fn path_like_target_names_are_rejected() {
        for name in ["../x", "a/b", "..", "a\\b", ""] {
            let config = RunConfig::default().with_targets(vec![TargetSpec::new(name, "monitoring")]);
            assert!(
                matches!(config.validate(), Err(RollguardError::Config(_))),
                "{name:?} accepted"
            );
        }
        assert!(RunConfig::default()
            .with_targets(vec![TargetSpec::new("grafana..v2", "monitoring")])
            .validate()
            .is_ok());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = RunConfig::default();
        assert_eq!(config.rollback_threshold, 3);
        assert_eq!(config.monitor_duration, Duration::from_secs(600));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.restart_threshold, 5);
        assert_eq!(config.retry, RetryPolicy::new(Duration::from_secs(5), 3));
        assert_eq!(config.sync_timeout, Duration::from_secs(300));
        assert_eq!(config.settle_delay, Duration::from_secs(10));
        assert_eq!(config.expected_branch, "dev");
        assert_eq!(config.reconciler.secret_name, "argocd-initial-admin-secret");
        assert_eq!(config.mode, RunMode::Unattended);
    }

    #[test]
    fn env_overrides_thresholds() {
        let vars = vec![
            ("ROLLGUARD_ROLLBACK_THRESHOLD".to_string(), "5".to_string()),
            ("ROLLGUARD_POLL_INTERVAL".to_string(), "2".to_string()),
            ("ROLLGUARD_RETRY_BASE".to_string(), "1".to_string()),
            ("ROLLGUARD_KUBE_CONTEXT".to_string(), "kind-dev".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let config = one_target().apply_env(vars).unwrap();
        assert_eq!(config.rollback_threshold, 5);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.retry.base, Duration::from_secs(1));
        assert_eq!(config.kube_context.as_deref(), Some("kind-dev"));
    }

    #[test]
    fn env_rejects_garbage_numbers() {
        let vars = vec![("ROLLGUARD_RETRY_MAX".to_string(), "three".to_string())];
        let err = one_target().apply_env(vars).unwrap_err();
        assert!(matches!(err, RollguardError::Config(_)));
    }

    #[test]
    fn toml_file_layers_over_defaults() {
        let raw = r#"
            rollback_threshold = 4
            poll_interval = 5
            expected_branch = "main"

            [argocd]
            namespace = "gitops"

            [[targets]]
            name = "grafana"
            namespace = "monitoring"
            files = ["apps/grafana/values.yaml"]
            check_identity = true
            expected_uid = 472

            [[targets]]
            name = "loki"
            namespace = "monitoring"
            workload = "statefulset/loki"
            log_scan = true
        "#;
        let config = RunConfig::default().merge_toml(raw).unwrap();
        assert_eq!(config.rollback_threshold, 4);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.monitor_duration, Duration::from_secs(600));
        assert_eq!(config.expected_branch, "main");
        assert_eq!(config.reconciler.namespace, "gitops");
        assert_eq!(config.reconciler.username, "admin");
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].expected_uid, Some(472));
        assert_eq!(config.targets[0].workload_ref(), "deployment/grafana");
        assert_eq!(config.targets[1].workload_ref(), "statefulset/loki");
        assert!(config.targets[1].log_scan);
        config.validate().unwrap();
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        let err = RunConfig::default().merge_toml("rollback_treshold = 4").unwrap_err();
        assert!(matches!(err, RollguardError::Config(_)));
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(RunConfig::default().validate().is_err());
        assert!(one_target().with_rollback_threshold(0).validate().is_err());
        assert!(one_target()
            .with_monitoring(Duration::from_secs(5), Duration::from_secs(10))
            .validate()
            .is_err());
        assert!(one_target()
            .with_monitoring(Duration::from_secs(5), Duration::ZERO)
            .validate()
            .is_err());
        let dup = RunConfig::default().with_targets(vec![
            TargetSpec::new("a", "ns"),
            TargetSpec::new("a", "other"),
        ]);
        assert!(dup.validate().is_err());
        one_target().validate().unwrap();
    }

    #[test]
    fn target_defaults() {
        let spec = TargetSpec::new("grafana", "monitoring");
        assert_eq!(spec.app_name(), "grafana");
        let spec = spec.with_app("monitoring-grafana");
        assert_eq!(spec.app_name(), "monitoring-grafana");
    }
}
