//! Classified pipeline failures.
//!
//! Errors travel as `anyhow::Error`; callers that need to branch on the failure
//! class recover the [`PipelineError`] with `downcast_ref` and inspect its
//! [`ErrorKind`]. Message text is for humans only and never drives control flow.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed diff text.
    Parse,
    /// Patch touches a path outside the declared impacted set.
    ScopeViolation,
    /// Context/remove mismatch or out-of-range hunk while applying.
    Apply,
    /// Patch touches a package manifest, lockfile, VCS internal, or secret.
    ForbiddenTarget,
    /// Impossible lifecycle transition or failed pre-transition assertion.
    Guard,
    /// Validation round failed (scans, tests, unchanged contract).
    Validation,
    /// A view calls an endpoint the backend does not declare.
    ContractIntegrity,
    /// Workspace precondition or restore failure.
    Workspace,
    /// External collaborator (generator, validation command) failed.
    Collaborator,
    /// Persisted meta-run state disagrees with itself.
    ResumeInconsistency,
    /// Self-heal attempts kept producing the same failure signature.
    SelfHealStalled,
    /// Self-heal attempts ran out without a pass.
    SelfHealExhausted,
}

impl ErrorKind {
    /// Fatal kinds are never retried by the run or meta controllers.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::Guard
                | ErrorKind::ContractIntegrity
                | ErrorKind::Workspace
                | ErrorKind::ResumeInconsistency
                | ErrorKind::SelfHealStalled
                | ErrorKind::SelfHealExhausted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Parse => "PARSE_ERROR",
            ErrorKind::ScopeViolation => "SCOPE_VIOLATION",
            ErrorKind::Apply => "APPLY_ERROR",
            ErrorKind::ForbiddenTarget => "FORBIDDEN_TARGET",
            ErrorKind::Guard => "GUARD_VIOLATION",
            ErrorKind::Validation => "VALIDATION_FAILED",
            ErrorKind::ContractIntegrity => "CONTRACT_INTEGRITY_FAILED",
            ErrorKind::Workspace => "WORKSPACE_ERROR",
            ErrorKind::Collaborator => "COLLABORATOR_ERROR",
            ErrorKind::ResumeInconsistency => "RESUME_INCONSISTENCY",
            ErrorKind::SelfHealStalled => "STALLED",
            ErrorKind::SelfHealExhausted => "MAX_SELF_HEAL_ATTEMPTS_REACHED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure tagged with its class.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

/// Find the classified error anywhere in an `anyhow` chain.
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map(|classified| classified.kind)
}

/// Shorthand used throughout the crate: `bail_kind!(Parse, "bad header {h}")`.
#[macro_export]
macro_rules! bail_kind {
    ($kind:ident, $($arg:tt)+) => {
        return Err($crate::error::PipelineError::new(
            $crate::error::ErrorKind::$kind,
            format!($($arg)+),
        )
        .into())
    };
}
