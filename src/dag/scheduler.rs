//! Ready-queue topological scheduling state.
//!
//! Operations with no unmet dependencies are eligible; newly eligible
//! operations are released as their dependencies complete. This is a
//! ready-queue execution, not a static levelized schedule, which matters
//! for throughput when dependency fan-out is uneven.
//!
//! Tie-break: when several operations become eligible simultaneously they
//! are returned in declared input order, so runs are deterministic and the
//! audit trail is reproducible.

use crate::dag::builder::{GraphBuilder, OpIndex, OperationGraph};
use crate::request::OperationSpec;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Status of one operation in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed {
        error: String,
    },
    /// Blocked by a failed (transitive) dependency; never started.
    Skipped,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed { .. } | Self::Skipped
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Scheduling state for one execution's operation graph.
#[derive(Debug)]
pub struct OpScheduler {
    graph: OperationGraph,
    status: Vec<OperationStatus>,
    completed: HashSet<OpIndex>,
}

impl OpScheduler {
    /// Build the scheduler; fails before anything runs if the graph has a
    /// cycle, a duplicate id or an unknown dependency.
    pub fn from_operations(operations: &[OperationSpec]) -> Result<Self> {
        let graph = GraphBuilder::new(operations.to_vec()).build()?;
        let status = vec![OperationStatus::Pending; graph.len()];
        Ok(Self {
            graph,
            status,
            completed: HashSet::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn operation(&self, index: OpIndex) -> Option<&OperationSpec> {
        self.graph.get(index)
    }

    pub fn status(&self, index: OpIndex) -> &OperationStatus {
        &self.status[index]
    }

    /// Eligible operations in declared input order: pending, with every
    /// dependency completed.
    pub fn ready(&self) -> Vec<OpIndex> {
        (0..self.graph.len())
            .filter(|&i| {
                self.status[i] == OperationStatus::Pending
                    && self.graph.dependencies_satisfied(i, &self.completed)
            })
            .collect()
    }

    pub fn mark_running(&mut self, index: OpIndex) {
        self.status[index] = OperationStatus::Running;
    }

    pub fn mark_completed(&mut self, index: OpIndex) {
        self.status[index] = OperationStatus::Completed;
        self.completed.insert(index);
    }

    /// Mark an operation failed and skip every operation that (transitively)
    /// depends on it. Siblings that do not depend on it are unaffected.
    pub fn mark_failed(&mut self, index: OpIndex, error: &str) {
        self.status[index] = OperationStatus::Failed {
            error: error.to_string(),
        };
        self.skip_dependents(index);
    }

    fn skip_dependents(&mut self, failed_idx: OpIndex) {
        let dependents: Vec<OpIndex> = self.graph.dependents(failed_idx).to_vec();
        for dep_idx in dependents {
            if !self.status[dep_idx].is_terminal() {
                self.status[dep_idx] = OperationStatus::Skipped;
                self.skip_dependents(dep_idx);
            }
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.status.iter().all(|s| s.is_terminal())
    }

    pub fn all_success(&self) -> bool {
        self.status.iter().all(|s| s.is_success())
    }

    pub fn running_count(&self) -> usize {
        self.status
            .iter()
            .filter(|s| matches!(s, OperationStatus::Running))
            .count()
    }
}
