//! Dependency-graph construction for requested operations.
//!
//! The builder takes the flat operation list from a request and constructs
//! a directed acyclic graph for scheduling. Cycle detection runs here,
//! before any operation executes; a cycle is a hard failure with zero
//! operations executed.

use crate::request::OperationSpec;
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};

/// Index into the operation list.
pub type OpIndex = usize;

/// A directed acyclic graph of operations.
#[derive(Debug)]
pub struct OperationGraph {
    operations: Vec<OperationSpec>,
    index_map: HashMap<String, OpIndex>,
    /// index -> operations that depend on it
    forward_edges: Vec<Vec<OpIndex>>,
    /// index -> operations it depends on
    reverse_edges: Vec<Vec<OpIndex>>,
}

impl OperationGraph {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn get(&self, index: OpIndex) -> Option<&OperationSpec> {
        self.operations.get(index)
    }

    pub fn get_index(&self, id: &str) -> Option<OpIndex> {
        self.index_map.get(id).copied()
    }

    pub fn operations(&self) -> &[OperationSpec] {
        &self.operations
    }

    /// Operations that depend on the given one (forward edges).
    pub fn dependents(&self, index: OpIndex) -> &[OpIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Operations the given one depends on (reverse edges).
    pub fn dependencies(&self, index: OpIndex) -> &[OpIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies_satisfied(&self, index: OpIndex, completed: &HashSet<OpIndex>) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }
}

/// Builder for operation graphs.
pub struct GraphBuilder {
    operations: Vec<OperationSpec>,
}

impl GraphBuilder {
    pub fn new(operations: Vec<OperationSpec>) -> Self {
        Self { operations }
    }

    /// Build and validate the graph:
    /// - operation ids must be unique
    /// - all dependencies must reference existing operations
    /// - no cycles
    pub fn build(self) -> Result<OperationGraph> {
        let mut index_map = HashMap::new();
        for (i, op) in self.operations.iter().enumerate() {
            if index_map.contains_key(&op.id) {
                bail!("Duplicate operation id: {}", op.id);
            }
            index_map.insert(op.id.clone(), i);
        }

        let mut forward_edges: Vec<Vec<OpIndex>> = vec![Vec::new(); self.operations.len()];
        let mut reverse_edges: Vec<Vec<OpIndex>> = vec![Vec::new(); self.operations.len()];

        for (to_idx, op) in self.operations.iter().enumerate() {
            for dep in &op.depends_on {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Unknown dependency '{}' in operation '{}': no operation with that id exists",
                        dep,
                        op.id
                    )
                })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = OperationGraph {
            operations: self.operations,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Kahn's algorithm: if a topological order cannot consume every node,
    /// the remainder is a cycle.
    fn validate_no_cycles(graph: &OperationGraph) -> Result<()> {
        let mut in_degree: Vec<usize> =
            graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<OpIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let cycle_ops: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.get(i).map(|op| op.id.as_str()))
                .collect();

            bail!(
                "Cycle detected in operation dependencies. Involved operations: {:?}",
                cycle_ops
            );
        }

        Ok(())
    }
}
