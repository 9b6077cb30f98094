//! Typed error hierarchy for the warden engine.
//!
//! Two top-level enums cover the two failure domains:
//! - `EngineError` — terminal execution failures (lock, sandbox, rollback)
//! - `OperationError` — per-operation failures, captured in outcomes and
//!   never raised past the scheduler
//!
//! Expected negative results (`denied`, a failed operation) are modeled as
//! data on `ExecutionResult` / `OperationOutcome`, not as errors.

use crate::request::OperationKind;
use std::path::PathBuf;
use thiserror::Error;

/// Terminal failures of the execution engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("policy document is invalid: {0}")]
    PolicyInvalid(String),

    #[error("execution lock for repository {fingerprint} is held by another execution")]
    LockContended { fingerprint: String },

    #[error("failed to persist lock marker at {path}: {source}")]
    LockStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sandbox worktree creation failed: {0}")]
    SandboxCreation(String),

    #[error("sandbox worktree cleanup failed at {path}: {reason}")]
    SandboxCleanup { path: PathBuf, reason: String },

    #[error("rollback to point '{point}' failed: {reason}")]
    RollbackFailed { point: String, reason: String },

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure of a single operation. Isolated to that operation and its
/// transitive dependents; siblings keep running.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("operation kind '{kind}' is not allowed by policy '{policy_id}'")]
    NotAllowed {
        kind: OperationKind,
        policy_id: String,
    },

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("path escapes the sandbox: {0}")]
    PathEscape(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
