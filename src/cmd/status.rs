//! Run inspection — `warden status`.

use anyhow::{bail, Result};
use console::style;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use warden::audit::RunTape;
use warden::request::{ExecutionResult, ExecutionStatus};

pub fn cmd_status(repo: &Path, state_dir: Option<PathBuf>, run: &Uuid) -> Result<()> {
    let paths = super::resolve_paths(repo, state_dir);
    let run_dir = paths.run_dir(run);
    if !run_dir.exists() {
        bail!("no run directory for execution {run}");
    }

    println!("{} {run}", style("Execution").bold());

    let result_path = run_dir.join("result.json");
    if result_path.exists() {
        let result = ExecutionResult::load(&result_path)?;
        let status = match result.status {
            ExecutionStatus::Success => style("success").green().bold(),
            ExecutionStatus::Denied => style("denied").yellow().bold(),
            ExecutionStatus::Failed => style("failed").red().bold(),
        };
        println!(
            "  status: {status}, started {}, ended {}",
            result.started_at.format("%Y-%m-%d %H:%M:%S"),
            result.ended_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(reason) = &result.denial_reason {
            println!("  reason: {reason}");
        }
        println!(
            "  operations: {} ({} failed), files merged: {}",
            result.operations.len(),
            result.operations.iter().filter(|o| !o.success).count(),
            result.changes_merged
        );
    } else {
        println!("  status: {} (no result recorded)", style("unknown").dim());
    }

    let tape = RunTape::new(&run_dir)?;
    let events = tape.get_events()?;
    println!("  tape: {} events", events.len());
    for event in &events {
        let kind = serde_json::to_value(event.event)?;
        let kind = kind.as_str().unwrap_or("unknown");
        match &event.operation_id {
            Some(op) => println!(
                "    {} {} [{}]",
                style(event.at.format("%H:%M:%S%.3f")).dim(),
                kind,
                op
            ),
            None => println!(
                "    {} {}",
                style(event.at.format("%H:%M:%S%.3f")).dim(),
                kind
            ),
        }
    }

    Ok(())
}
