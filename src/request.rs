//! Execution request and result documents.
//!
//! An `ExecutionRequest` is produced by an upstream planning stage and is
//! never mutated by the engine. The `ExecutionResult` is the terminal
//! artifact of one execution, constructed once and persisted for later
//! inspection.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// How the batch of operations is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Dependency-graph scheduling with bounded concurrency.
    #[default]
    Dag,
    /// Strict input order; first failure stops the batch.
    Linear,
}

/// The closed set of operation kinds the engine can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    WriteFile,
    AppendFile,
    DeleteFile,
    MoveFile,
    MkDir,
}

impl OperationKind {
    /// Every kind, used to validate handler registries exhaustively.
    pub const ALL: [OperationKind; 5] = [
        OperationKind::WriteFile,
        OperationKind::AppendFile,
        OperationKind::DeleteFile,
        OperationKind::MoveFile,
        OperationKind::MkDir,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::WriteFile => "write_file",
            OperationKind::AppendFile => "append_file",
            OperationKind::DeleteFile => "delete_file",
            OperationKind::MoveFile => "move_file",
            OperationKind::MkDir => "mk_dir",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    pub id: String,
    pub kind: OperationKind,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Operation ids that must complete before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Immutable input to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: Uuid,
    #[serde(default)]
    pub mode: ExecutionMode,
    pub operations: Vec<OperationSpec>,
    #[serde(default)]
    pub requires_review: bool,
    #[serde(default)]
    pub target_branch: Option<String>,
    pub repo_path: PathBuf,
}

impl ExecutionRequest {
    /// Load a request document from JSON or YAML, by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file {}", path.display()))?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if is_yaml {
            serde_yaml::from_str(&content).context("Failed to parse request YAML")
        } else {
            serde_json::from_str(&content).context("Failed to parse request JSON")
        }
    }
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Denied,
    Failed,
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Denied => "denied",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of a single operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub id: String,
    pub kind: OperationKind,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl OperationOutcome {
    pub fn success(id: &str, kind: OperationKind, duration_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            kind,
            success: true,
            error: None,
            duration_ms,
        }
    }

    pub fn failure(id: &str, kind: OperationKind, error: &str, duration_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            kind,
            success: false,
            error: Some(error.to_string()),
            duration_ms,
        }
    }
}

/// The terminal artifact of one execution lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub result_id: Uuid,
    pub request_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub operations: Vec<OperationOutcome>,
    /// Files brought back from the sandbox into the main repository.
    pub changes_merged: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
}

impl ExecutionResult {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize execution result")?;
        std::fs::write(path, json).context("Failed to write execution result")?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read result file {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse execution result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_request() -> ExecutionRequest {
        ExecutionRequest {
            id: Uuid::new_v4(),
            mode: ExecutionMode::Dag,
            operations: vec![OperationSpec {
                id: "op-1".to_string(),
                kind: OperationKind::WriteFile,
                params: serde_json::json!({"path": "a.txt", "content": "hi"}),
                depends_on: vec![],
            }],
            requires_review: false,
            target_branch: None,
            repo_path: PathBuf::from("."),
        }
    }

    #[test]
    fn test_operation_kind_serde_names() {
        let json = serde_json::to_string(&OperationKind::WriteFile).unwrap();
        assert_eq!(json, "\"write_file\"");
        let kind: OperationKind = serde_json::from_str("\"delete_file\"").unwrap();
        assert_eq!(kind, OperationKind::DeleteFile);
    }

    #[test]
    fn test_request_load_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("request.json");
        let request = sample_request();
        std::fs::write(&path, serde_json::to_string_pretty(&request).unwrap()).unwrap();

        let loaded = ExecutionRequest::load(&path).unwrap();
        assert_eq!(loaded.id, request.id);
        assert_eq!(loaded.operations.len(), 1);
        assert_eq!(loaded.operations[0].kind, OperationKind::WriteFile);
    }

    #[test]
    fn test_request_load_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("request.yaml");
        let request = sample_request();
        std::fs::write(&path, serde_yaml::to_string(&request).unwrap()).unwrap();

        let loaded = ExecutionRequest::load(&path).unwrap();
        assert_eq!(loaded.id, request.id);
        assert_eq!(loaded.mode, ExecutionMode::Dag);
    }

    #[test]
    fn test_request_defaults() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "operations": [],
            "repo_path": "/repo"
        });
        let request: ExecutionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.mode, ExecutionMode::Dag);
        assert!(!request.requires_review);
        assert!(request.target_branch.is_none());
    }

    #[test]
    fn test_result_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("result.json");
        let result = ExecutionResult {
            result_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            status: ExecutionStatus::Failed,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            operations: vec![OperationOutcome::failure(
                "op-1",
                OperationKind::MoveFile,
                "source missing",
                12,
            )],
            changes_merged: 0,
            denial_reason: None,
        };
        result.save(&path).unwrap();
        let loaded = ExecutionResult::load(&path).unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.operations[0].error.as_deref(), Some("source missing"));
    }

    #[test]
    fn test_status_display_matches_serde() {
        assert_eq!(ExecutionStatus::Denied.to_string(), "denied");
        assert!(ExecutionStatus::Success.is_success());
        assert!(!ExecutionStatus::Denied.is_success());
    }
}
