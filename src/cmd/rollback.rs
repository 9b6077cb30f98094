//! Out-of-band restore — `warden rollback`.
//!
//! Rollback points are recorded against the sandbox worktree, but their
//! snapshot commits live in the repository's shared object database and
//! survive the worktree teardown. The restore therefore targets the main
//! repository directly.

use anyhow::{bail, Result};
use console::style;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use warden::rollback::RollbackManager;

pub fn cmd_rollback(
    repo: &Path,
    state_dir: Option<PathBuf>,
    run: &Uuid,
    step: Option<&str>,
    no_verify: bool,
) -> Result<()> {
    let paths = super::resolve_paths(repo, state_dir);
    let run_dir = paths.run_dir(run);
    if !run_dir.exists() {
        bail!("no run directory for execution {run}");
    }

    let manager = RollbackManager::new(repo, &run_dir)?;
    let point = match step {
        // Per-operation points are stored as `step-<operation id>`; accept
        // the bare operation id as well as the full point name.
        Some(name) => manager
            .point(name)
            .or_else(|| manager.point(&format!("step-{name}")))
            .ok_or_else(|| anyhow::anyhow!("no rollback point named '{name}' in run {run}"))?,
        None => manager
            .latest()
            .ok_or_else(|| anyhow::anyhow!("run {run} recorded no rollback points"))?,
    }
    .clone();

    let result = manager.rollback_to(&point, !no_verify)?;
    let proof = manager.generate_rollback_proof(&point, &result)?;

    println!(
        "{} restored {} to point '{}' ({})",
        style("Rollback:").bold(),
        repo.display(),
        point.name,
        &point.commit[..12.min(point.commit.len())]
    );
    match result.checksums_match {
        Some(true) => println!("  checksums: {}", style("verified").green()),
        Some(false) => {
            println!(
                "  checksums: {} ({} mismatched files)",
                style("MISMATCH").red().bold(),
                result.mismatched.len()
            );
            for file in &result.mismatched {
                println!("    {file}");
            }
        }
        None => println!("  checksums: not verified"),
    }
    println!("  proof: {}", proof.display());

    if result.checksums_match == Some(false) {
        bail!("rollback restored the tree but checksum verification failed");
    }
    Ok(())
}
