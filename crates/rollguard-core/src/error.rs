//! Error types for rollguard
//!
//! Classifies every failure the supervisor can observe:
//! - Precondition failures that abort the run before any mutation
//! - Authorization failures that re-enter the auth chain
//! - Transient network failures retried with backoff
//! - Convergence timeouts (reported, never treated as failure)
//! - Sustained failures that trigger rollback
//! - Rollbacks that cannot proceed for lack of a backup

use std::path::PathBuf;

/// Main rollguard error type
#[derive(Debug, thiserror::Error)]
pub enum RollguardError {
    /// A prerequisite check failed; nothing was mutated
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The reconciler rejected our credentials
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Network hiccup talking to the reconciler or workload orchestrator
    #[error("transient failure during {operation}: {message}")]
    Transient {
        /// Operation that failed
        operation: String,
        /// Underlying message
        message: String,
    },

    /// Target did not converge inside its window
    #[error("target {target} did not converge within {waited_secs}s")]
    ConvergenceTimeout {
        /// Target name
        target: String,
        /// Seconds waited
        waited_secs: u64,
    },

    /// Failure counter reached the rollback threshold
    #[error("target {target} failed {failures} consecutive health checks")]
    SustainedFailure {
        /// Target name
        target: String,
        /// Consecutive failures observed
        failures: u32,
    },

    /// Rollback requested but no backup exists
    #[error("cannot roll back {target}: no backup captured")]
    RollbackImpossible {
        /// Target name
        target: String,
    },

    /// Configuration transform or commit failed
    #[error("apply failed: {0}")]
    Apply(String),

    /// External command exited unsuccessfully
    #[error("`{program}` exited with {status}: {stderr}")]
    Command {
        /// Program name
        program: String,
        /// Exit status description
        status: String,
        /// Captured stderr (trimmed)
        stderr: String,
    },

    /// External command could not be parsed
    #[error("unexpected output from {source_name}: {message}")]
    Parse {
        /// What produced the output
        source_name: String,
        /// Parse failure description
        message: String,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error on a specific path
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {duration_secs}s")]
    Timeout {
        /// Operation name
        operation: String,
        /// Deadline in seconds
        duration_secs: u64,
    },

    /// Run interrupted by a signal
    #[error("run interrupted")]
    Cancelled,
}

impl RollguardError {
    /// Wrap an i/o error with the path it concerns
    #[inline]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a transient error
    #[inline]
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if error is worth retrying with backoff
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// Check if error should re-enter the auth chain
    #[inline]
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Check if error aborts the whole run
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Precondition(_) | Self::Config(_) | Self::Cancelled)
    }
}

/// Convenience alias used across the crate
pub type Result<T, E = RollguardError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollguard_error_display() {
        let err = RollguardError::Precondition("cluster unreachable".to_string());
        assert!(err.to_string().contains("precondition failed"));

        let err = RollguardError::RollbackImpossible {
            target: "grafana".to_string(),
        };
        assert_eq!(err.to_string(), "cannot roll back grafana: no backup captured");
    }

    #[test]
    fn rollguard_error_is_retryable() {
        assert!(RollguardError::transient("sync", "connection reset").is_retryable());
        assert!(RollguardError::Timeout {
            operation: "login".to_string(),
            duration_secs: 30
        }
        .is_retryable());
        assert!(!RollguardError::Auth("token expired".to_string()).is_retryable());
        assert!(!RollguardError::Precondition("x".to_string()).is_retryable());
    }

    #[test]
    fn rollguard_error_classification() {
        assert!(RollguardError::Auth("401".to_string()).is_auth());
        assert!(RollguardError::Precondition("x".to_string()).is_fatal());
        assert!(!RollguardError::Apply("x".to_string()).is_fatal());
        assert!(!RollguardError::SustainedFailure {
            target: "t".to_string(),
            failures: 3
        }
        .is_fatal());
    }
}
