//! Sandbox policy: the allow-list of operation kinds and numeric limits.
//!
//! Loaded once per execution and read-only afterwards. `is_allowed` is a
//! pure predicate called once per operation, so a multi-operation batch can
//! partially fail the allow-list check.

use crate::errors::EngineError;
use crate::request::OperationKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub policy_id: String,
    pub version: u32,
    pub allowed_operations: Vec<OperationKind>,
    /// Upper bound on files merged back from the sandbox.
    pub max_files_touched: usize,
    /// Upper bound on operations in one request.
    pub max_operations: usize,
}

impl SandboxPolicy {
    /// A permissive policy for tests and local dry runs.
    pub fn permissive(policy_id: &str) -> Self {
        Self {
            policy_id: policy_id.to_string(),
            version: 1,
            allowed_operations: OperationKind::ALL.to_vec(),
            max_files_touched: 200,
            max_operations: 100,
        }
    }

    /// Load a policy document from JSON or YAML, by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file {}", path.display()))?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if is_yaml {
            serde_yaml::from_str(&content).context("Failed to parse policy YAML")
        } else {
            serde_json::from_str(&content).context("Failed to parse policy JSON")
        }
    }

    /// Structural validation, run before any side effect. A malformed
    /// policy aborts the execution as `denied`.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.policy_id.trim().is_empty() {
            return Err(EngineError::PolicyInvalid("policy_id is empty".into()));
        }
        if self.version == 0 {
            return Err(EngineError::PolicyInvalid("version must be >= 1".into()));
        }
        if self.allowed_operations.is_empty() {
            return Err(EngineError::PolicyInvalid(
                "allowed_operations is empty".into(),
            ));
        }
        if self.max_files_touched == 0 || self.max_operations == 0 {
            return Err(EngineError::PolicyInvalid(
                "numeric limits must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Pure allow-list predicate. No I/O, no state beyond the loaded policy.
    pub fn is_allowed(&self, kind: OperationKind) -> bool {
        self.allowed_operations.contains(&kind)
    }
}
