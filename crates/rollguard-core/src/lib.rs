//! rollguard core - unattended remediation supervisor for GitOps clusters
//!
//! Applies a declarative change, waits for the reconciler to converge each
//! target, and rolls targets back on sustained failure:
//! - Validates prerequisites before any mutation
//! - Acquires reconciler credentials through an ordered fallback chain
//! - Backs up, transforms and commits target configuration
//! - Triggers sync with retry and a credential-free fallback
//! - Monitors every target concurrently and rolls back on repeated crashes
//! - Restores backups and reports on every exit path
//!
//! # Example
//!
//! ```rust,ignore
//! use rollguard_core::prelude::*;
//!
//! # async fn example(ports: Ports) {
//! let config = RunConfig::default()
//!     .with_targets(vec![TargetSpec::new("grafana", "monitoring")]);
//! let orchestrator = Orchestrator::new(config, ports);
//!
//! let report = orchestrator.run(std::future::pending()).await;
//! println!("{}", report.render_text());
//! std::process::exit(report.exit_code());
//! # }
//! ```

// Foundations
pub mod config;
pub mod error;
pub mod ports;
pub mod retry;
pub mod types;

// Components
pub mod applier;
pub mod auth;
pub mod backup;
pub mod guard;
pub mod monitor;
pub mod orchestrator;
pub mod phase;
pub mod rollback;
pub mod sync;
pub mod validator;

// Re-exports for convenience
pub use applier::{ApplyReport, ChangeApplier};
pub use auth::{AttemptResult, AuthAttempt, AuthResolution, AuthResolver, AuthSession, AuthStrategy, SessionCell};
pub use backup::{Backup, BackupStore, FileSnapshot, LiveSnapshot, RestoreSummary};
pub use config::{ReconcilerSettings, RunConfig, RunMode, TargetSpec};
pub use error::{Result, RollguardError};
pub use guard::{RunGuard, RunState};
pub use monitor::{FailureTracker, HealthMonitor, LogScanCheck, MonitorSettings, NonRootIdentityCheck, TickVerdict};
pub use orchestrator::{CheckEntry, CheckReport, Orchestrator, VerifyEntry, VerifyReport};
pub use phase::{Classification, PhaseOutcome, PhaseRecord, PhaseRecorder, RunReport, TargetReport};
pub use ports::{
    AuthClient, ClusterProbe, ConfigTransform, MintedToken, NeverConfirm, OperatorPrompt, Ports,
    ReconcilerBackend, Repository, SecondaryCheck, SecretStore, ToolInventory, Workloads,
};
pub use retry::{with_backoff, RetryPolicy};
pub use rollback::RollbackEngine;
pub use sync::{DirectPollSettings, SyncResult, SyncRoute, SyncTrigger};
pub use types::{
    AppStatus, HealthSample, HealthStatus, RunId, SyncStatus, Target, TargetStatus, WorkloadPhase,
    WorkloadStatus,
};
pub use validator::{PrerequisiteValidator, Prerequisites};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for embedding rollguard
    pub use crate::{
        Classification, Orchestrator, Ports, Result, RetryPolicy, RunConfig, RunMode, RunReport,
        TargetSpec, TargetStatus, RollguardError,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
