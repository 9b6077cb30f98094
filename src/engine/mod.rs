//! The execution engine: one entry point that drives a request through the
//! full lifecycle.
//!
//! Order of phases is fixed: receive, validate policy, review gate, lock,
//! sandbox, pre-execution rollback point, scheduled operations, merge or
//! rollback, teardown. Denials and operation failures are expected results
//! and come back as `ExecutionResult` data; an `Err` from `execute` means
//! the engine itself broke.

use crate::audit::{EventKind, RunTape, TapeHandle};
use crate::checksum::repo_fingerprint;
use crate::config::{WardenPaths, DEFAULT_MAX_PARALLEL};
use crate::dag::{DagExecutor, OperationExecutor};
use crate::errors::{EngineError, OperationError};
use crate::lock::LockStore;
use crate::ops::HandlerRegistry;
use crate::policy::SandboxPolicy;
use crate::request::{
    ExecutionMode, ExecutionRequest, ExecutionResult, ExecutionStatus, OperationOutcome,
    OperationSpec,
};
use crate::review::{ApprovalStore, ReviewGate};
use crate::rollback::RollbackManager;
use crate::sandbox::Sandbox;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on concurrently running operations in DAG mode.
    pub max_parallel: usize,
    /// Verify recorded checksums after a rollback restore.
    pub verify_checksums: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            verify_checksums: true,
        }
    }
}

/// Outcome of the sandboxed operation phase, before teardown.
struct PhaseOutcome {
    success: bool,
    outcomes: Vec<OperationOutcome>,
    changes_merged: usize,
    failure_reason: Option<String>,
}

pub struct ExecutorEngine {
    paths: WardenPaths,
    locks: LockStore,
    approvals: ApprovalStore,
    config: EngineConfig,
}

impl ExecutorEngine {
    pub fn new(paths: WardenPaths) -> Self {
        let locks = LockStore::new(&paths.locks_dir);
        let approvals = ApprovalStore::new(&paths.approvals_dir);
        Self {
            paths,
            locks,
            approvals,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Drive one request through the full lifecycle.
    ///
    /// Returns `Ok` with a `denied` or `failed` result for policy denials,
    /// missing approvals, lock contention and operation failures; `Err` only
    /// when the engine itself cannot proceed (unusable state directory,
    /// broken tape).
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        policy: &SandboxPolicy,
    ) -> Result<ExecutionResult> {
        let started_at = Utc::now();
        self.paths.ensure_directories()?;
        let run_dir = self.paths.run_dir(&request.id);
        std::fs::create_dir_all(&run_dir).context("Failed to create run directory")?;
        let tape = TapeHandle::new(RunTape::new(&run_dir)?);

        tape.log_event(
            EventKind::ExecutionReceived,
            None,
            serde_json::json!({
                "request_id": request.id,
                "mode": request.mode,
                "operations": request.operations.len(),
                "repo_path": request.repo_path,
            }),
        )?;

        // Policy gate. Structural problems and limit violations deny the
        // request before any lock or sandbox exists.
        if let Err(e) = policy.validate() {
            return self.finish(
                &tape,
                request,
                &run_dir,
                started_at,
                ExecutionStatus::Denied,
                Vec::new(),
                0,
                Some(e.to_string()),
            );
        }
        if request.operations.len() > policy.max_operations {
            return self.finish(
                &tape,
                request,
                &run_dir,
                started_at,
                ExecutionStatus::Denied,
                Vec::new(),
                0,
                Some(format!(
                    "request has {} operations, policy '{}' allows at most {}",
                    request.operations.len(),
                    policy.policy_id,
                    policy.max_operations
                )),
            );
        }
        tape.log_event(
            EventKind::PolicyValidated,
            None,
            serde_json::json!({
                "policy_id": policy.policy_id,
                "version": policy.version,
            }),
        )?;

        // Review gate. Approval evidence is consumed here, never created.
        if ReviewGate::requires_review(request) {
            match ReviewGate::check_approval(&self.approvals, &request.id)? {
                Some(evidence) => {
                    tape.log_event(
                        EventKind::ReviewChecked,
                        None,
                        serde_json::json!({
                            "approved_by": evidence.approved_by,
                            "approved_at": evidence.approved_at,
                        }),
                    )?;
                }
                None => {
                    return self.finish(
                        &tape,
                        request,
                        &run_dir,
                        started_at,
                        ExecutionStatus::Denied,
                        Vec::new(),
                        0,
                        Some("review required but no approval evidence found".to_string()),
                    );
                }
            }
        }

        // Execution lock. Contention is terminal; the engine never waits.
        let fingerprint = repo_fingerprint(&request.repo_path);
        if !self.locks.acquire(&request.id, &fingerprint)? {
            return self.finish(
                &tape,
                request,
                &run_dir,
                started_at,
                ExecutionStatus::Failed,
                Vec::new(),
                0,
                Some(
                    EngineError::LockContended {
                        fingerprint: fingerprint.clone(),
                    }
                    .to_string(),
                ),
            );
        }
        tape.log_event(
            EventKind::LockAcquired,
            None,
            serde_json::json!({ "fingerprint": fingerprint }),
        )?;

        let mut sandbox = match Sandbox::create_worktree(
            &request.repo_path,
            &request.id,
            request.target_branch.as_deref(),
        ) {
            Ok(sandbox) => sandbox,
            Err(e) => {
                self.release_lock(&tape, &request.id, &fingerprint);
                return self.finish(
                    &tape,
                    request,
                    &run_dir,
                    started_at,
                    ExecutionStatus::Failed,
                    Vec::new(),
                    0,
                    Some(e.to_string()),
                );
            }
        };
        tape.log_event(
            EventKind::SandboxCreated,
            None,
            serde_json::json!({
                "path": sandbox.path(),
                "branch": sandbox.branch_name(),
            }),
        )?;

        let phase = self
            .run_operations(request, policy, &tape, &sandbox, &run_dir)
            .await;

        // Teardown always runs, and never masks the phase outcome.
        match sandbox.remove_worktree() {
            Ok(()) => {
                tape.log_event(EventKind::SandboxRemoved, None, serde_json::json!({}))?;
            }
            Err(e) => {
                tracing::warn!(error = %e, "sandbox teardown failed");
                tape.log_event(
                    EventKind::CleanupWarning,
                    None,
                    serde_json::json!({ "error": e.to_string() }),
                )?;
            }
        }
        self.release_lock(&tape, &request.id, &fingerprint);

        match phase {
            Ok(phase) => {
                let status = if phase.success {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::Failed
                };
                self.finish(
                    &tape,
                    request,
                    &run_dir,
                    started_at,
                    status,
                    phase.outcomes,
                    phase.changes_merged,
                    phase.failure_reason,
                )
            }
            Err(e) => self.finish(
                &tape,
                request,
                &run_dir,
                started_at,
                ExecutionStatus::Failed,
                Vec::new(),
                0,
                Some(e.to_string()),
            ),
        }
    }

    /// Everything that happens inside the sandbox: pre-execution rollback
    /// point, scheduled operations, then merge-back or rollback.
    async fn run_operations(
        &self,
        request: &ExecutionRequest,
        policy: &SandboxPolicy,
        tape: &TapeHandle,
        sandbox: &Sandbox,
        run_dir: &Path,
    ) -> Result<PhaseOutcome> {
        let mut manager = RollbackManager::new(sandbox.path(), run_dir)?;
        let pre = manager.create_rollback_point("pre-execution", true)?;
        tape.log_event(
            EventKind::RollbackPointCreated,
            None,
            serde_json::json!({ "name": pre.name, "commit": pre.commit }),
        )?;
        let manager = Arc::new(Mutex::new(manager));

        let guarded = Arc::new(GuardedExecutor {
            policy: policy.clone(),
            registry: HandlerRegistry::new()?,
            sandbox_root: sandbox.path().to_path_buf(),
            tape: tape.clone(),
            rollback: manager.clone(),
        });

        let dag = DagExecutor::new(self.config.max_parallel);
        let (success, outcomes) = match request.mode {
            ExecutionMode::Dag => dag.execute_parallel(&request.operations, guarded).await?,
            ExecutionMode::Linear => dag.execute_linear(&request.operations, guarded).await?,
        };

        let manager = manager
            .lock()
            .map_err(|_| anyhow!("rollback manager mutex poisoned"))?;

        if !success {
            let rollback = manager.rollback_to(&pre, self.config.verify_checksums)?;
            let proof = manager.generate_rollback_proof(&pre, &rollback)?;
            tape.log_event(
                EventKind::RollbackPerformed,
                None,
                serde_json::json!({
                    "point": pre.name,
                    "checksums_match": rollback.checksums_match,
                    "proof": proof,
                }),
            )?;
            let failure_reason = outcomes
                .iter()
                .find(|o| !o.success)
                .map(|o| {
                    format!(
                        "operation '{}' failed: {}",
                        o.id,
                        o.error.as_deref().unwrap_or("unknown error")
                    )
                });
            return Ok(PhaseOutcome {
                success: false,
                outcomes,
                changes_merged: 0,
                failure_reason,
            });
        }

        let changes = sandbox.collect_changes(&pre.commit)?;
        if changes.total() > policy.max_files_touched {
            let rollback = manager.rollback_to(&pre, self.config.verify_checksums)?;
            let proof = manager.generate_rollback_proof(&pre, &rollback)?;
            tape.log_event(
                EventKind::RollbackPerformed,
                None,
                serde_json::json!({
                    "point": pre.name,
                    "checksums_match": rollback.checksums_match,
                    "proof": proof,
                }),
            )?;
            return Ok(PhaseOutcome {
                success: false,
                outcomes,
                changes_merged: 0,
                failure_reason: Some(format!(
                    "execution touched {} files, policy '{}' allows at most {}",
                    changes.total(),
                    policy.policy_id,
                    policy.max_files_touched
                )),
            });
        }

        let changes_merged = sandbox.merge_back(&changes)?;
        tape.log_event(
            EventKind::ChangesMerged,
            None,
            serde_json::json!({
                "files": changes_merged,
                "added": changes.added.len(),
                "modified": changes.modified.len(),
                "deleted": changes.deleted.len(),
            }),
        )?;

        Ok(PhaseOutcome {
            success: true,
            outcomes,
            changes_merged,
            failure_reason: None,
        })
    }

    fn release_lock(&self, tape: &TapeHandle, execution_id: &Uuid, fingerprint: &str) {
        match self.locks.release(execution_id, fingerprint) {
            Ok(()) => {
                if let Err(e) = tape.log_event(
                    EventKind::LockReleased,
                    None,
                    serde_json::json!({ "fingerprint": fingerprint }),
                ) {
                    tracing::warn!(error = %e, "failed to record lock release");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, fingerprint, "failed to release execution lock");
                if let Err(e) = tape.log_event(
                    EventKind::CleanupWarning,
                    None,
                    serde_json::json!({ "error": e.to_string() }),
                ) {
                    tracing::warn!(error = %e, "failed to record cleanup warning");
                }
            }
        }
    }

    /// Assemble the terminal result, persist it and log the terminal event.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        tape: &TapeHandle,
        request: &ExecutionRequest,
        run_dir: &Path,
        started_at: chrono::DateTime<Utc>,
        status: ExecutionStatus,
        outcomes: Vec<OperationOutcome>,
        changes_merged: usize,
        reason: Option<String>,
    ) -> Result<ExecutionResult> {
        let result = ExecutionResult {
            result_id: Uuid::new_v4(),
            request_id: request.id,
            status,
            started_at,
            ended_at: Utc::now(),
            operations: outcomes,
            changes_merged,
            denial_reason: reason.clone(),
        };
        result.save(&run_dir.join("result.json"))?;

        let event = match status {
            ExecutionStatus::Success => EventKind::ExecutionCompleted,
            ExecutionStatus::Denied => EventKind::ExecutionDenied,
            ExecutionStatus::Failed => EventKind::ExecutionFailed,
        };
        tape.log_event(
            event,
            None,
            serde_json::json!({
                "status": status,
                "reason": reason,
                "changes_merged": changes_merged,
            }),
        )?;

        tracing::info!(
            request_id = %request.id,
            %status,
            changes_merged,
            "execution finished"
        );
        Ok(result)
    }
}

/// Per-operation wrapper the scheduler calls into: allow-list check, handler
/// dispatch, step snapshot and audit events, all from inside the sandbox.
struct GuardedExecutor {
    policy: SandboxPolicy,
    registry: HandlerRegistry,
    sandbox_root: PathBuf,
    tape: TapeHandle,
    rollback: Arc<Mutex<RollbackManager>>,
}

#[async_trait]
impl OperationExecutor for GuardedExecutor {
    fn begin(&self, op: &OperationSpec) -> Result<(), OperationError> {
        self.tape
            .log_event(
                EventKind::OperationStarted,
                Some(&op.id),
                serde_json::json!({ "kind": op.kind }),
            )
            .map_err(OperationError::Other)
    }

    async fn execute(&self, op: &OperationSpec) -> Result<serde_json::Value, OperationError> {
        // Allow-list check before any side effect. A disallowed operation
        // fails itself and its dependents; siblings keep running.
        if !self.policy.is_allowed(op.kind) {
            let err = OperationError::NotAllowed {
                kind: op.kind,
                policy_id: self.policy.policy_id.clone(),
            };
            self.tape
                .log_event(
                    EventKind::OperationFailed,
                    Some(&op.id),
                    serde_json::json!({ "error": err.to_string() }),
                )
                .map_err(OperationError::Other)?;
            return Err(err);
        }

        self.tape
            .start_step(&op.id)
            .map_err(OperationError::Other)?;

        match self.registry.dispatch(op.kind, &self.sandbox_root, &op.params) {
            Ok(detail) => {
                self.tape
                    .end_step(&op.id, Some(&self.sandbox_root))
                    .map_err(OperationError::Other)?;
                let point = {
                    let mut manager = self.rollback.lock().map_err(|_| {
                        OperationError::Other(anyhow!("rollback manager mutex poisoned"))
                    })?;
                    manager
                        .create_rollback_point(&format!("step-{}", op.id), false)
                        .map_err(OperationError::Other)?
                };
                self.tape
                    .log_event(
                        EventKind::RollbackPointCreated,
                        Some(&op.id),
                        serde_json::json!({ "name": point.name, "commit": point.commit }),
                    )
                    .map_err(OperationError::Other)?;
                self.tape
                    .log_event(EventKind::OperationCompleted, Some(&op.id), detail.clone())
                    .map_err(OperationError::Other)?;
                Ok(detail)
            }
            Err(e) => {
                self.tape
                    .log_event(
                        EventKind::OperationFailed,
                        Some(&op.id),
                        serde_json::json!({ "error": e.to_string() }),
                    )
                    .map_err(OperationError::Other)?;
                Err(e)
            }
        }
    }
}
