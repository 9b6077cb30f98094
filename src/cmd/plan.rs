//! Request planning — `warden plan`.
//!
//! Turns a prior dry-run report (a list of proposed operations against one
//! repository) into an executable request document, validating everything
//! that can be checked without side effects: graph validity, and the policy
//! allow-list when a policy is supplied. Nothing is locked, sandboxed or
//! executed.

use anyhow::{bail, Context, Result};
use console::style;
use serde::Deserialize;
use std::path::Path;
use uuid::Uuid;
use warden::dag::GraphBuilder;
use warden::policy::SandboxPolicy;
use warden::request::{ExecutionMode, ExecutionRequest, OperationSpec};

/// Dry-run report produced by an upstream planning stage.
#[derive(Debug, Deserialize)]
struct DryRunReport {
    repo_path: std::path::PathBuf,
    operations: Vec<OperationSpec>,
    #[serde(default)]
    target_branch: Option<String>,
    #[serde(default)]
    requires_review: bool,
}

pub fn cmd_plan(
    dry_run: &Path,
    output: &Path,
    policy_path: Option<&Path>,
    linear: bool,
) -> Result<()> {
    let content = std::fs::read_to_string(dry_run)
        .with_context(|| format!("Failed to read dry-run report {}", dry_run.display()))?;
    let report: DryRunReport =
        serde_json::from_str(&content).context("Failed to parse dry-run report")?;

    // Catches duplicate ids, unknown dependencies and cycles.
    let graph = GraphBuilder::new(report.operations.clone()).build()?;

    if let Some(policy_path) = policy_path {
        let policy = SandboxPolicy::load(policy_path)?;
        policy.validate()?;
        if report.operations.len() > policy.max_operations {
            bail!(
                "dry-run proposes {} operations, policy '{}' allows at most {}",
                report.operations.len(),
                policy.policy_id,
                policy.max_operations
            );
        }
        let disallowed: Vec<&str> = report
            .operations
            .iter()
            .filter(|op| !policy.is_allowed(op.kind))
            .map(|op| op.id.as_str())
            .collect();
        if !disallowed.is_empty() {
            bail!(
                "policy '{}' does not allow these operations: {}",
                policy.policy_id,
                disallowed.join(", ")
            );
        }
    }

    let request = ExecutionRequest {
        id: Uuid::new_v4(),
        mode: if linear {
            ExecutionMode::Linear
        } else {
            ExecutionMode::Dag
        },
        operations: report.operations,
        requires_review: report.requires_review,
        target_branch: report.target_branch,
        repo_path: report.repo_path,
    };
    let json =
        serde_json::to_string_pretty(&request).context("Failed to serialize request")?;
    std::fs::write(output, json)
        .with_context(|| format!("Failed to write request to {}", output.display()))?;

    println!(
        "{} wrote request {} ({} operations) to {}",
        style("Plan OK:").green().bold(),
        request.id,
        graph.len(),
        output.display()
    );
    for op in graph.operations() {
        if op.depends_on.is_empty() {
            println!("  {} {}", style(&op.id).bold(), style(op.kind).dim());
        } else {
            println!(
                "  {} {} (after {})",
                style(&op.id).bold(),
                style(op.kind).dim(),
                op.depends_on.join(", ")
            );
        }
    }

    Ok(())
}
