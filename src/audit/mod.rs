//! Audit trail types: append-only events and per-step checksum snapshots.
//!
//! The run tape is the system of record for "what happened". Every external
//! state transition in the engine emits exactly one event; downstream replay
//! tooling depends on that 1:1 mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every externally visible state transition of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExecutionReceived,
    PolicyValidated,
    ReviewChecked,
    LockAcquired,
    SandboxCreated,
    RollbackPointCreated,
    StepStarted,
    StepCompleted,
    OperationStarted,
    OperationCompleted,
    OperationFailed,
    ChangesMerged,
    RollbackPerformed,
    SandboxRemoved,
    LockReleased,
    ExecutionCompleted,
    ExecutionDenied,
    ExecutionFailed,
    CleanupWarning,
}

/// One append-only audit record. Once written, never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event: EventKind,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(event: EventKind, operation_id: Option<&str>, details: serde_json::Value) -> Self {
        Self {
            event,
            at: Utc::now(),
            operation_id: operation_id.map(String::from),
            details,
        }
    }
}

/// Checksum snapshot emitted at a step boundary. Written once, read many
/// times; this is what makes "rollback to step N" recovery possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub step_id: String,
    pub at: DateTime<Utc>,
    pub checksums: BTreeMap<String, String>,
}

pub mod tape;
pub use tape::{RunTape, TapeHandle};
