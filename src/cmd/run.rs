//! Full execution lifecycle — `warden run`.

use anyhow::Result;
use console::style;
use std::path::{Path, PathBuf};
use warden::engine::{EngineConfig, ExecutorEngine};
use warden::policy::SandboxPolicy;
use warden::request::{ExecutionMode, ExecutionRequest, ExecutionStatus};

/// Returns whether the execution ended in `success`; denials and failures
/// are printed, not raised.
pub async fn cmd_run(
    request_path: &Path,
    policy_path: &Path,
    state_dir: Option<PathBuf>,
    max_parallel: usize,
    linear: bool,
    no_verify: bool,
) -> Result<bool> {
    let mut request = ExecutionRequest::load(request_path)?;
    let policy = SandboxPolicy::load(policy_path)?;
    if linear {
        request.mode = ExecutionMode::Linear;
    }

    let paths = super::resolve_paths(&request.repo_path, state_dir);
    let run_dir = paths.run_dir(&request.id);
    let engine = ExecutorEngine::new(paths).with_config(EngineConfig {
        max_parallel,
        verify_checksums: !no_verify,
    });

    let result = engine.execute(&request, &policy).await?;

    let status = match result.status {
        ExecutionStatus::Success => style("success").green().bold(),
        ExecutionStatus::Denied => style("denied").yellow().bold(),
        ExecutionStatus::Failed => style("failed").red().bold(),
    };
    println!("Execution {} {status}", request.id);
    if let Some(reason) = &result.denial_reason {
        println!("  reason: {reason}");
    }
    for op in &result.operations {
        if op.success {
            println!(
                "  {} {} ({} ms)",
                style("ok").green(),
                op.id,
                op.duration_ms
            );
        } else {
            println!(
                "  {} {}: {}",
                style("failed").red(),
                op.id,
                op.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    if result.status.is_success() {
        println!("  {} files merged back", result.changes_merged);
    }
    println!("  run directory: {}", run_dir.display());

    Ok(result.status.is_success())
}
