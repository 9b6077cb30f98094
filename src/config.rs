use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Default bound on concurrently running operations in DAG mode.
pub const DEFAULT_MAX_PARALLEL: usize = 5;

/// On-disk layout for all warden state.
///
/// One directory per execution id holds the run tape, step snapshots and
/// rollback artifacts. Lock and approval markers live outside the
/// per-execution directories so they remain discoverable across process
/// restarts.
#[derive(Debug, Clone)]
pub struct WardenPaths {
    pub state_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub approvals_dir: PathBuf,
    pub runs_dir: PathBuf,
}

impl WardenPaths {
    /// State layout rooted at `<repo>/.warden`.
    pub fn for_repo(repo_path: &Path) -> Self {
        Self::at(repo_path.join(".warden"))
    }

    /// State layout rooted at an explicit directory.
    pub fn at(state_dir: PathBuf) -> Self {
        Self {
            locks_dir: state_dir.join("locks"),
            approvals_dir: state_dir.join("approvals"),
            runs_dir: state_dir.join("runs"),
            state_dir,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.locks_dir).context("Failed to create locks directory")?;
        std::fs::create_dir_all(&self.approvals_dir)
            .context("Failed to create approvals directory")?;
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs directory")?;
        Ok(())
    }

    /// Per-execution directory: tape, snapshots, result, rollback artifacts.
    pub fn run_dir(&self, execution_id: &Uuid) -> PathBuf {
        self.runs_dir.join(execution_id.to_string())
    }

    pub fn lock_path(&self, fingerprint: &str) -> PathBuf {
        self.locks_dir.join(format!("{fingerprint}.lock"))
    }

    pub fn approval_path(&self, execution_id: &Uuid) -> PathBuf {
        self.approvals_dir.join(format!("{execution_id}.json"))
    }
}
