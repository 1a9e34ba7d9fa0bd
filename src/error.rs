//! Error types for the keel orchestrator
//!
//! Every failure names the phase (and step, where there is one) it came from
//! and carries the collaborator's own error text verbatim. The CLI maps these
//! variants onto process exit codes via [`Error::exit_code`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Named phases of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseName {
    /// Provisioning engine init/validate/plan/apply
    Provision,
    /// Configuration engine role bootstrap
    Configure,
    /// Ordered destruction of provisioned resources
    Teardown,
    /// Remote state backend creation and migration
    MigrateBackend,
    /// Secrets engine trust reconciliation
    FixAuth,
}

impl PhaseName {
    /// Stable, lowercase name used in logs and error output
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Provision => "provision",
            PhaseName::Configure => "configure",
            PhaseName::Teardown => "teardown",
            PhaseName::MigrateBackend => "migrate-backend",
            PhaseName::FixAuth => "fix-auth",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit code for precondition and usage errors
pub const EXIT_PRECONDITION: i32 = 1;
/// Exit code when the user declined a confirmation
pub const EXIT_DECLINED: i32 = 2;
/// Exit code when a named phase failed
pub const EXIT_PHASE_FAILED: i32 = 3;

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// One or more prerequisites are missing. Always the complete list.
    #[error("missing prerequisites: {}", missing.join(", "))]
    Precondition {
        /// Names of every requirement that failed its check
        missing: Vec<String>,
    },

    /// A confirmation gate resolved `Declined`
    #[error("{phase} aborted: confirmation declined")]
    Declined {
        /// Phase whose gate was declined
        phase: PhaseName,
    },

    /// A phase step failed after exhausting its retries
    #[error("{phase} failed at step '{step}'{}: {message}", target_suffix(target))]
    StepFailed {
        /// Phase that failed
        phase: PhaseName,
        /// Step within the phase
        step: String,
        /// Remote target the step ran against, if any
        target: Option<String>,
        /// Collaborator's raw error text
        message: String,
    },

    /// Secrets-engine reconciliation stopped part way
    #[error(
        "fix-auth failed at step '{step}' (last completed: {}): {message}",
        last_completed.as_deref().unwrap_or("none")
    )]
    Reconcile {
        /// Step that failed
        step: String,
        /// Last step that completed before the failure
        last_completed: Option<String>,
        /// Collaborator's raw error text
        message: String,
    },

    /// The remote state lock is held by another invocation
    #[error("{phase} failed: state lock is held by another run: {message}")]
    LockContention {
        /// Phase that hit the lock
        phase: PhaseName,
        /// Provisioning engine output describing the lock holder
        message: String,
    },

    /// A target never became reachable
    #[error("readiness failed: target '{target}' unreachable after {attempts} attempt(s)")]
    Unreachable {
        /// Target name
        target: String,
        /// Outer attempts made
        attempts: u32,
    },

    /// An external program could not be started
    #[error("failed to start '{program}': {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Usage or configuration error
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration file could not be read or parsed
    #[error("config error in {}: {message}", path.display())]
    Config {
        /// Path of the config file
        path: PathBuf,
        /// Description of the problem
        message: String,
    },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// HTTP transport error talking to the secrets engine
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn target_suffix(target: &Option<String>) -> String {
    match target {
        Some(t) => format!(" on '{}'", t),
        None => String::new(),
    }
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a step failure without a remote target
    pub fn step(phase: PhaseName, step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepFailed {
            phase,
            step: step.into(),
            target: None,
            message: message.into(),
        }
    }

    /// Create a step failure that happened on a specific target
    pub fn step_on(
        phase: PhaseName,
        step: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::StepFailed {
            phase,
            step: step.into(),
            target: Some(target.into()),
            message: message.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether this error is a normal user-driven termination
    pub fn is_declined(&self) -> bool {
        matches!(self, Error::Declined { .. })
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Precondition { .. } | Error::Validation(_) | Error::Config { .. } => {
                EXIT_PRECONDITION
            }
            Error::Declined { .. } => EXIT_DECLINED,
            _ => EXIT_PHASE_FAILED,
        }
    }
}

/// Extension trait to convert foreign errors into a step failure.
///
/// Reduces boilerplate for `.map_err(|e| Error::step(phase, step, e.to_string()))`.
pub trait StepErrorExt<T> {
    /// Convert an error to [`Error::StepFailed`] using its Display implementation
    fn step_err(self, phase: PhaseName, step: &str) -> Result<T, Error>;
}

impl<T, E: fmt::Display> StepErrorExt<T> for std::result::Result<T, E> {
    fn step_err(self, phase: PhaseName, step: &str) -> Result<T, Error> {
        self.map_err(|e| Error::step(phase, step, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_lists_every_missing_item() {
        let err = Error::Precondition {
            missing: vec!["terraform".into(), "aws credentials".into()],
        };
        assert_eq!(
            err.to_string(),
            "missing prerequisites: terraform, aws credentials"
        );
        assert_eq!(err.exit_code(), EXIT_PRECONDITION);
    }

    #[test]
    fn declined_is_its_own_exit_code() {
        let err = Error::Declined {
            phase: PhaseName::Teardown,
        };
        assert!(err.is_declined());
        assert_eq!(err.exit_code(), EXIT_DECLINED);
    }

    #[test]
    fn step_failure_names_phase_step_and_target() {
        let err = Error::step_on(
            PhaseName::Configure,
            "control-plane",
            "cp-1",
            "kubeadm init: port 6443 in use",
        );
        assert_eq!(
            err.to_string(),
            "configure failed at step 'control-plane' on 'cp-1': kubeadm init: port 6443 in use"
        );
        assert_eq!(err.exit_code(), EXIT_PHASE_FAILED);
    }

    #[test]
    fn reconcile_reports_last_completed_step() {
        let err = Error::Reconcile {
            step: "write-auth-config".into(),
            last_completed: Some("enable-auth-method".into()),
            message: "permission denied".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("write-auth-config"));
        assert!(msg.contains("last completed: enable-auth-method"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn step_err_preserves_raw_text() {
        let raw: std::result::Result<(), &str> = Err("Error: NoSuchBucket");
        let err = raw
            .step_err(PhaseName::MigrateBackend, "create-bucket")
            .unwrap_err();
        assert!(err.to_string().ends_with("Error: NoSuchBucket"));
    }
}
