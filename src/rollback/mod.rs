//! Rollback points and checksum-verified restore.
//!
//! A rollback point records a snapshot commit of the working tree plus an
//! optional checksum map. Restore is a hard reset to that commit followed by
//! removal of untracked files; verification then recomputes a fresh checksum
//! set and compares byte-for-byte. Restore happens first, verification
//! after: a mismatch is a surfaced signal, never a reason to undo the
//! restore (file content is often not verifiable until it is restored).

use crate::checksum::{checksum_tree, diff_checksums};
use crate::errors::EngineError;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use git2::{build::CheckoutBuilder, Repository, ResetType, Signature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub name: String,
    /// Snapshot commit the working tree can be restored to.
    pub commit: String,
    /// Working tree the point was recorded against.
    pub worktree: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksums: Option<BTreeMap<String, String>>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one restore. A checksum mismatch does not clear `success`;
/// the restore already happened and the mismatch is reported, not hidden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub point: String,
    pub success: bool,
    pub before_commit: Option<String>,
    pub after_commit: String,
    /// `None` when verification was not requested or the point recorded no
    /// checksums.
    pub checksums_match: Option<bool>,
    #[serde(default)]
    pub mismatched: Vec<String>,
}

/// Externally auditable evidence that a rollback was exact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackProof {
    pub point: String,
    pub before_commit: Option<String>,
    pub after_commit: String,
    pub checksums_match: Option<bool>,
    pub mismatched: Vec<String>,
    pub verified_files: usize,
    pub created_at: DateTime<Utc>,
}

pub struct RollbackManager {
    worktree: PathBuf,
    run_dir: PathBuf,
    points: Vec<RollbackPoint>,
}

impl RollbackManager {
    /// Open a manager for one working tree, reloading any points already
    /// recorded for this run.
    pub fn new(worktree: &Path, run_dir: &Path) -> Result<Self> {
        let points_path = run_dir.join("rollback-points.json");
        let points = if points_path.exists() {
            let content = std::fs::read_to_string(&points_path)
                .context("Failed to read rollback points")?;
            serde_json::from_str(&content).context("Failed to parse rollback points")?
        } else {
            Vec::new()
        };
        Ok(Self {
            worktree: worktree.to_path_buf(),
            run_dir: run_dir.to_path_buf(),
            points,
        })
    }

    /// Record a rollback point: a snapshot commit of the current tree plus,
    /// optionally, a checksum map over the tracked directories. Recorded
    /// checksums are never recomputed in place afterwards.
    pub fn create_rollback_point(
        &mut self,
        name: &str,
        with_checksums: bool,
    ) -> Result<RollbackPoint> {
        let commit = self.snapshot_commit(&format!("[warden] rollback point '{name}'"))?;
        let checksums = if with_checksums {
            Some(checksum_tree(&self.worktree)?)
        } else {
            None
        };

        let point = RollbackPoint {
            name: name.to_string(),
            commit,
            worktree: self.worktree.clone(),
            checksums,
            created_at: Utc::now(),
        };
        self.points.push(point.clone());
        self.save_points()?;

        tracing::info!(name, commit = %point.commit, "rollback point created");
        Ok(point)
    }

    pub fn points(&self) -> &[RollbackPoint] {
        &self.points
    }

    /// Most recent match wins when names repeat.
    pub fn point(&self, name: &str) -> Option<&RollbackPoint> {
        self.points.iter().rev().find(|p| p.name == name)
    }

    pub fn latest(&self) -> Option<&RollbackPoint> {
        self.points.last()
    }

    /// Restore the working tree to the point's commit (hard reset, removing
    /// untracked files), then optionally verify checksums.
    pub fn rollback_to(
        &self,
        point: &RollbackPoint,
        verify_checksums: bool,
    ) -> Result<RollbackResult, EngineError> {
        let repo = Repository::open(&self.worktree).map_err(|e| EngineError::RollbackFailed {
            point: point.name.clone(),
            reason: format!("cannot open working tree: {e}"),
        })?;

        let before_commit = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .map(|c| c.id().to_string());

        let oid = git2::Oid::from_str(&point.commit).map_err(|e| EngineError::RollbackFailed {
            point: point.name.clone(),
            reason: format!("invalid commit id: {e}"),
        })?;
        let target = repo
            .find_object(oid, None)
            .map_err(|e| EngineError::RollbackFailed {
                point: point.name.clone(),
                reason: format!("commit not found: {e}"),
            })?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.reset(&target, ResetType::Hard, Some(&mut checkout))
            .map_err(|e| EngineError::RollbackFailed {
                point: point.name.clone(),
                reason: format!("hard reset failed: {e}"),
            })?;

        // The hard reset restores tracked files; files the snapshot never
        // saw are removed separately so engine state next to the repository
        // is left alone.
        self.prune_files_not_in_snapshot(&repo, &point.name, oid)?;

        // Restore is done. Verification is a fresh recomputation compared
        // against the recorded map; a mismatch is reported, not suppressed.
        let (checksums_match, mismatched) = match (&point.checksums, verify_checksums) {
            (Some(recorded), true) => {
                let fresh = checksum_tree(&self.worktree).map_err(|e| {
                    EngineError::RollbackFailed {
                        point: point.name.clone(),
                        reason: format!("checksum recomputation failed: {e}"),
                    }
                })?;
                let mismatched = diff_checksums(recorded, &fresh);
                if !mismatched.is_empty() {
                    tracing::warn!(
                        point = %point.name,
                        files = mismatched.len(),
                        "rollback checksum verification found mismatches"
                    );
                }
                (Some(mismatched.is_empty()), mismatched)
            }
            _ => (None, Vec::new()),
        };

        tracing::info!(point = %point.name, commit = %point.commit, "rollback performed");

        Ok(RollbackResult {
            point: point.name.clone(),
            success: true,
            before_commit,
            after_commit: point.commit.clone(),
            checksums_match,
            mismatched,
        })
    }

    /// Write the immutable proof artifact for one rollback invocation.
    pub fn generate_rollback_proof(
        &self,
        point: &RollbackPoint,
        result: &RollbackResult,
    ) -> Result<PathBuf> {
        let proof = RollbackProof {
            point: point.name.clone(),
            before_commit: result.before_commit.clone(),
            after_commit: result.after_commit.clone(),
            checksums_match: result.checksums_match,
            mismatched: result.mismatched.clone(),
            verified_files: point.checksums.as_ref().map(|c| c.len()).unwrap_or(0),
            created_at: Utc::now(),
        };
        let safe_name: String = point
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        let path = self.run_dir.join(format!("rollback-proof-{safe_name}.json"));
        let json =
            serde_json::to_string_pretty(&proof).context("Failed to serialize rollback proof")?;
        std::fs::write(&path, json).context("Failed to write rollback proof")?;
        Ok(path)
    }

    /// Remove working-tree files absent from the snapshot commit's tree.
    /// Uses the same walker exclusions as checksum maps, so `.git` and the
    /// warden state directory are never touched.
    fn prune_files_not_in_snapshot(
        &self,
        repo: &Repository,
        point_name: &str,
        commit: git2::Oid,
    ) -> Result<(), EngineError> {
        let tree = repo
            .find_commit(commit)
            .and_then(|c| c.tree())
            .map_err(|e| EngineError::RollbackFailed {
                point: point_name.to_string(),
                reason: format!("snapshot tree not found: {e}"),
            })?;

        let current = checksum_tree(&self.worktree).map_err(|e| EngineError::RollbackFailed {
            point: point_name.to_string(),
            reason: format!("working tree walk failed: {e}"),
        })?;
        for rel in current.keys() {
            if tree.get_path(Path::new(rel)).is_err() {
                let path = self.worktree.join(rel);
                std::fs::remove_file(&path).map_err(|e| EngineError::RollbackFailed {
                    point: point_name.to_string(),
                    reason: format!("cannot remove {}: {e}", path.display()),
                })?;
            }
        }
        Ok(())
    }

    /// Snapshot the current tree as a commit, handling an unborn branch the
    /// same way the first commit of a repository would.
    fn snapshot_commit(&self, message: &str) -> Result<String> {
        let repo =
            Repository::open(&self.worktree).context("Failed to open working tree repository")?;
        let mut index = repo.index().context("Failed to open index")?;
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .context("Failed to stage working tree")?;
        index.write().context("Failed to write index")?;

        let tree_id = index.write_tree().context("Failed to write tree")?;
        let tree = repo.find_tree(tree_id).context("Failed to find tree")?;
        let sig = Signature::now("warden", "warden@localhost")
            .map_err(|e| anyhow!("signature: {e}"))?;

        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let commit_id = match parent {
            Some(parent) => repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
                .context("Failed to create snapshot commit")?,
            None => repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[])
                .context("Failed to create initial snapshot commit")?,
        };

        Ok(commit_id.to_string())
    }

    fn save_points(&self) -> Result<()> {
        std::fs::create_dir_all(&self.run_dir).context("Failed to create run directory")?;
        let json = serde_json::to_string_pretty(&self.points)
            .context("Failed to serialize rollback points")?;
        std::fs::write(self.run_dir.join("rollback-points.json"), json)
            .context("Failed to write rollback points")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        fs::write(dir.path().join("base.txt"), "base\n").unwrap();
        dir
    }

    fn manager(repo: &Path, run_dir: &Path) -> RollbackManager {
        RollbackManager::new(repo, run_dir).unwrap()
    }

    #[test]
    fn test_rollback_restores_exact_content() {
        let repo = setup_repo();
        let run = tempdir().unwrap();
        let mut mgr = manager(repo.path(), run.path());

        let point = mgr.create_rollback_point("pre-execution", true).unwrap();

        fs::write(repo.path().join("base.txt"), "mutated\n").unwrap();
        fs::write(repo.path().join("untracked.txt"), "junk\n").unwrap();

        let result = mgr.rollback_to(&point, true).unwrap();
        assert!(result.success);
        assert_eq!(result.checksums_match, Some(true));
        assert!(result.mismatched.is_empty());
        assert_eq!(
            fs::read_to_string(repo.path().join("base.txt")).unwrap(),
            "base\n"
        );
        assert!(!repo.path().join("untracked.txt").exists());
    }

    #[test]
    fn test_checksum_mismatch_is_reported_not_suppressed() {
        let repo = setup_repo();
        let run = tempdir().unwrap();
        let mut mgr = manager(repo.path(), run.path());

        let mut point = mgr.create_rollback_point("pre-execution", true).unwrap();
        // Doctor the recorded map so the restored tree cannot match it.
        point
            .checksums
            .as_mut()
            .unwrap()
            .insert("base.txt".to_string(), "0".repeat(64));

        let result = mgr.rollback_to(&point, true).unwrap();
        assert!(result.success, "restore itself must still succeed");
        assert_eq!(result.checksums_match, Some(false));
        assert_eq!(result.mismatched, vec!["base.txt".to_string()]);
    }

    #[test]
    fn test_verification_skipped_when_not_requested() {
        let repo = setup_repo();
        let run = tempdir().unwrap();
        let mut mgr = manager(repo.path(), run.path());
        let point = mgr.create_rollback_point("p", true).unwrap();
        let result = mgr.rollback_to(&point, false).unwrap();
        assert_eq!(result.checksums_match, None);
    }

    #[test]
    fn test_points_addressable_by_name_and_latest() {
        let repo = setup_repo();
        let run = tempdir().unwrap();
        let mut mgr = manager(repo.path(), run.path());

        mgr.create_rollback_point("step-1", false).unwrap();
        fs::write(repo.path().join("two.txt"), "2\n").unwrap();
        mgr.create_rollback_point("step-2", false).unwrap();

        assert_eq!(mgr.points().len(), 2);
        assert_eq!(mgr.point("step-1").unwrap().name, "step-1");
        assert_eq!(mgr.latest().unwrap().name, "step-2");
        assert!(mgr.point("missing").is_none());
    }

    #[test]
    fn test_points_persist_across_manager_instances() {
        let repo = setup_repo();
        let run = tempdir().unwrap();
        {
            let mut mgr = manager(repo.path(), run.path());
            mgr.create_rollback_point("step-1", true).unwrap();
        }
        let mgr = manager(repo.path(), run.path());
        assert_eq!(mgr.points().len(), 1);
        assert!(mgr.point("step-1").unwrap().checksums.is_some());
    }

    #[test]
    fn test_rollback_to_intermediate_step() {
        let repo = setup_repo();
        let run = tempdir().unwrap();
        let mut mgr = manager(repo.path(), run.path());

        fs::write(repo.path().join("one.txt"), "1\n").unwrap();
        let step1 = mgr.create_rollback_point("step-1", true).unwrap();
        fs::write(repo.path().join("two.txt"), "2\n").unwrap();
        mgr.create_rollback_point("step-2", true).unwrap();
        fs::write(repo.path().join("three.txt"), "3\n").unwrap();
        mgr.create_rollback_point("step-3", true).unwrap();

        let result = mgr.rollback_to(&step1, true).unwrap();
        assert_eq!(result.checksums_match, Some(true));
        assert!(repo.path().join("one.txt").exists());
        assert!(!repo.path().join("two.txt").exists());
        assert!(!repo.path().join("three.txt").exists());
    }

    #[test]
    fn test_rollback_proof_is_written() {
        let repo = setup_repo();
        let run = tempdir().unwrap();
        let mut mgr = manager(repo.path(), run.path());

        let point = mgr.create_rollback_point("pre-execution", true).unwrap();
        fs::write(repo.path().join("base.txt"), "changed\n").unwrap();
        let result = mgr.rollback_to(&point, true).unwrap();
        let path = mgr.generate_rollback_proof(&point, &result).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let proof: RollbackProof = serde_json::from_str(&content).unwrap();
        assert_eq!(proof.point, "pre-execution");
        assert_eq!(proof.after_commit, point.commit);
        assert_eq!(proof.checksums_match, Some(true));
        assert!(proof.verified_files >= 1);
    }
}
