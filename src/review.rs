//! Review gate: checks whether a request requires human approval and
//! whether approval evidence already exists.
//!
//! The gate never creates approvals. Evidence is written by an external
//! review workflow into the approvals directory and merely consumed here.

use crate::request::ExecutionRequest;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Approval produced by an external actor, keyed by execution id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEvidence {
    pub execution_id: Uuid,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Persisted approval store.
#[derive(Debug, Clone)]
pub struct ApprovalStore {
    approvals_dir: PathBuf,
}

impl ApprovalStore {
    pub fn new(approvals_dir: &Path) -> Self {
        Self {
            approvals_dir: approvals_dir.to_path_buf(),
        }
    }

    /// Look up approval evidence for an execution. Malformed or mismatched
    /// evidence counts as absent.
    pub fn get(&self, execution_id: &Uuid) -> Result<Option<ApprovalEvidence>> {
        let path = self.approvals_dir.join(format!("{execution_id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read approval file {}", path.display()))?;
        let evidence: ApprovalEvidence = match serde_json::from_str(&content) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(%execution_id, error = %e, "ignoring malformed approval file");
                return Ok(None);
            }
        };
        if evidence.execution_id != *execution_id {
            tracing::warn!(
                %execution_id,
                found = %evidence.execution_id,
                "approval file names a different execution; treating as absent"
            );
            return Ok(None);
        }
        Ok(Some(evidence))
    }
}

/// The review checkpoint itself.
pub struct ReviewGate;

impl ReviewGate {
    /// Whether the request needs human sign-off before execution.
    pub fn requires_review(request: &ExecutionRequest) -> bool {
        request.requires_review
    }

    /// Consume approval evidence if present.
    pub fn check_approval(
        store: &ApprovalStore,
        execution_id: &Uuid,
    ) -> Result<Option<ApprovalEvidence>> {
        store.get(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ExecutionMode, OperationKind, OperationSpec};
    use tempfile::tempdir;

    fn request(requires_review: bool) -> ExecutionRequest {
        ExecutionRequest {
            id: Uuid::new_v4(),
            mode: ExecutionMode::Dag,
            operations: vec![OperationSpec {
                id: "op-1".to_string(),
                kind: OperationKind::WriteFile,
                params: serde_json::Value::Null,
                depends_on: vec![],
            }],
            requires_review,
            target_branch: None,
            repo_path: PathBuf::from("."),
        }
    }

    fn write_approval(dir: &Path, evidence: &ApprovalEvidence) {
        let path = dir.join(format!("{}.json", evidence.execution_id));
        std::fs::write(path, serde_json::to_string_pretty(evidence).unwrap()).unwrap();
    }

    #[test]
    fn test_requires_review_reads_flag() {
        assert!(ReviewGate::requires_review(&request(true)));
        assert!(!ReviewGate::requires_review(&request(false)));
    }

    #[test]
    fn test_check_approval_absent() {
        let dir = tempdir().unwrap();
        let store = ApprovalStore::new(dir.path());
        let found = ReviewGate::check_approval(&store, &Uuid::new_v4()).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_check_approval_present() {
        let dir = tempdir().unwrap();
        let store = ApprovalStore::new(dir.path());
        let id = Uuid::new_v4();
        write_approval(
            dir.path(),
            &ApprovalEvidence {
                execution_id: id,
                approved_by: "reviewer@example.com".to_string(),
                approved_at: Utc::now(),
                note: Some("looks safe".to_string()),
            },
        );

        let found = ReviewGate::check_approval(&store, &id).unwrap().unwrap();
        assert_eq!(found.approved_by, "reviewer@example.com");
    }

    #[test]
    fn test_mismatched_evidence_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let store = ApprovalStore::new(dir.path());
        let wanted = Uuid::new_v4();
        // Evidence file named after `wanted` but approving a different id.
        let evidence = ApprovalEvidence {
            execution_id: Uuid::new_v4(),
            approved_by: "reviewer".to_string(),
            approved_at: Utc::now(),
            note: None,
        };
        let path = dir.path().join(format!("{wanted}.json"));
        std::fs::write(path, serde_json::to_string(&evidence).unwrap()).unwrap();

        assert!(store.get(&wanted).unwrap().is_none());
    }

    #[test]
    fn test_malformed_evidence_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let store = ApprovalStore::new(dir.path());
        let id = Uuid::new_v4();
        std::fs::write(dir.path().join(format!("{id}.json")), "not json").unwrap();
        assert!(store.get(&id).unwrap().is_none());
    }
}
