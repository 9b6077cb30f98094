//! Sandboxed working copies.
//!
//! Every execution gets an isolated, disposable git worktree rooted at a
//! unique path, optionally checked out onto a fresh branch. The sandbox is
//! the only place operation side effects may land; nothing outside it is
//! mutated until changes are explicitly merged back.

use crate::errors::EngineError;
use anyhow::{Context, Result};
use git2::{BranchType, Delta, DiffOptions, Repository, WorktreeAddOptions, WorktreePruneOptions};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Files changed in the sandbox relative to a base commit.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

impl ChangeSet {
    pub fn total(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

pub struct Sandbox {
    repo_path: PathBuf,
    worktree_path: PathBuf,
    worktree_name: String,
    branch_name: String,
    removed: bool,
}

impl Sandbox {
    /// Create an isolated worktree for one execution, on a fresh branch
    /// (`target_branch` when given, otherwise a generated name).
    pub fn create_worktree(
        repo_path: &Path,
        execution_id: &Uuid,
        target_branch: Option<&str>,
    ) -> Result<Self, EngineError> {
        let repo = Repository::open(repo_path)
            .map_err(|e| EngineError::SandboxCreation(format!("cannot open repository: {e}")))?;

        let head = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(|_| {
                EngineError::SandboxCreation(
                    "repository has no commits; a sandbox needs a HEAD to branch from".into(),
                )
            })?;

        let worktree_name = format!("warden-{execution_id}");
        let branch_name = target_branch
            .map(String::from)
            .unwrap_or_else(|| format!("warden/{execution_id}"));

        let base_dir = std::env::temp_dir().join("warden-sandboxes");
        std::fs::create_dir_all(&base_dir)
            .map_err(|e| EngineError::SandboxCreation(format!("cannot create base dir: {e}")))?;
        let worktree_path = base_dir.join(&worktree_name);

        let branch = repo
            .branch(&branch_name, &head, false)
            .map_err(|e| EngineError::SandboxCreation(format!("cannot create branch: {e}")))?;
        let reference = branch.into_reference();

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));

        if let Err(e) = repo.worktree(&worktree_name, &worktree_path, Some(&opts)) {
            // Leave no half-created branch behind.
            if let Ok(mut b) = repo.find_branch(&branch_name, BranchType::Local) {
                b.delete().ok();
            }
            return Err(EngineError::SandboxCreation(format!(
                "git worktree add failed: {e}"
            )));
        }

        tracing::info!(
            path = %worktree_path.display(),
            branch = %branch_name,
            "created sandbox worktree"
        );

        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            worktree_path,
            worktree_name,
            branch_name,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.worktree_path
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    /// Tear the worktree down. Idempotent, and safe to call even after a
    /// partial creation: every step is best-effort except the prune itself.
    pub fn remove_worktree(&mut self) -> Result<(), EngineError> {
        if self.removed {
            return Ok(());
        }

        let repo = Repository::open(&self.repo_path).map_err(|e| EngineError::SandboxCleanup {
            path: self.worktree_path.clone(),
            reason: format!("cannot open repository: {e}"),
        })?;

        if let Ok(worktree) = repo.find_worktree(&self.worktree_name) {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).locked(true).working_tree(true);
            worktree
                .prune(Some(&mut opts))
                .map_err(|e| EngineError::SandboxCleanup {
                    path: self.worktree_path.clone(),
                    reason: e.to_string(),
                })?;
        }

        if self.worktree_path.exists() {
            std::fs::remove_dir_all(&self.worktree_path).map_err(|e| {
                EngineError::SandboxCleanup {
                    path: self.worktree_path.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        // Branch deletion failure is non-fatal; the worktree is already gone.
        if let Ok(mut branch) = repo.find_branch(&self.branch_name, BranchType::Local) {
            if let Err(e) = branch.delete() {
                tracing::warn!(
                    branch = %self.branch_name,
                    error = %e,
                    "failed to delete sandbox branch, may need manual cleanup"
                );
            }
        }

        self.removed = true;
        tracing::info!(path = %self.worktree_path.display(), "removed sandbox worktree");
        Ok(())
    }

    /// Files changed in the sandbox working tree since `base_commit`.
    pub fn collect_changes(&self, base_commit: &str) -> Result<ChangeSet> {
        let repo = Repository::open(&self.worktree_path)
            .context("Failed to open sandbox worktree repository")?;
        let base_oid = git2::Oid::from_str(base_commit).context("Invalid base commit id")?;
        let base_tree = repo
            .find_commit(base_oid)
            .context("Base commit not found")?
            .tree()
            .context("Base commit has no tree")?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true);

        let diff = repo
            .diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))
            .context("Failed to diff sandbox against base commit")?;

        let mut changes = ChangeSet::default();
        diff.foreach(
            &mut |delta, _progress| {
                if let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) {
                    let path = path.to_path_buf();
                    match delta.status() {
                        Delta::Added | Delta::Untracked => changes.added.push(path),
                        Delta::Modified => changes.modified.push(path),
                        Delta::Deleted => changes.deleted.push(path),
                        _ => {}
                    }
                }
                true
            },
            None,
            None,
            None,
        )
        .context("Failed to walk sandbox diff")?;

        Ok(changes)
    }

    /// Copy changed files back into the main repository working tree.
    /// Returns the number of files brought back.
    pub fn merge_back(&self, changes: &ChangeSet) -> Result<usize> {
        let mut merged = 0;

        for rel in changes.added.iter().chain(changes.modified.iter()) {
            let source = self.worktree_path.join(rel);
            let target = self.repo_path.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::copy(&source, &target).with_context(|| {
                format!(
                    "Failed to copy {} back to {}",
                    source.display(),
                    target.display()
                )
            })?;
            merged += 1;
        }

        for rel in &changes.deleted {
            let target = self.repo_path.join(rel);
            if target.exists() {
                std::fs::remove_file(&target)
                    .with_context(|| format!("Failed to delete {}", target.display()))?;
                merged += 1;
            }
        }

        tracing::info!(merged, "merged sandbox changes back into repository");
        Ok(merged)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = self.remove_worktree() {
                tracing::error!(error = %e, path = %self.worktree_path.display(),
                    "failed to remove sandbox worktree on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        commit_file(dir.path(), "README.md", "# repo\n", "init");
        dir
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap();
        }
    }

    fn head_sha(dir: &Path) -> String {
        let repo = Repository::open(dir).unwrap();
        repo.head()
            .unwrap()
            .peel_to_commit()
            .unwrap()
            .id()
            .to_string()
    }

    #[test]
    fn test_create_and_remove_worktree() {
        let repo = setup_repo();
        let id = Uuid::new_v4();
        let mut sandbox = Sandbox::create_worktree(repo.path(), &id, None).unwrap();

        assert!(sandbox.path().is_dir());
        assert!(sandbox.path().join("README.md").exists());
        assert_eq!(sandbox.branch_name(), &format!("warden/{id}"));

        let path = sandbox.path().to_path_buf();
        sandbox.remove_worktree().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_worktree_is_idempotent() {
        let repo = setup_repo();
        let mut sandbox = Sandbox::create_worktree(repo.path(), &Uuid::new_v4(), None).unwrap();
        sandbox.remove_worktree().unwrap();
        sandbox.remove_worktree().unwrap();
    }

    #[test]
    fn test_create_with_target_branch() {
        let repo = setup_repo();
        let mut sandbox =
            Sandbox::create_worktree(repo.path(), &Uuid::new_v4(), Some("feature/x")).unwrap();
        assert_eq!(sandbox.branch_name(), "feature/x");
        sandbox.remove_worktree().unwrap();
    }

    #[test]
    fn test_create_fails_without_commits() {
        let dir = tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let result = Sandbox::create_worktree(dir.path(), &Uuid::new_v4(), None);
        assert!(matches!(result, Err(EngineError::SandboxCreation(_))));
    }

    #[test]
    fn test_collect_changes_and_merge_back() {
        let repo = setup_repo();
        commit_file(repo.path(), "keep.txt", "original\n", "add keep");
        let base = head_sha(repo.path());

        let mut sandbox = Sandbox::create_worktree(repo.path(), &Uuid::new_v4(), None).unwrap();

        fs::write(sandbox.path().join("new.txt"), "fresh\n").unwrap();
        fs::write(sandbox.path().join("keep.txt"), "edited\n").unwrap();

        let changes = sandbox.collect_changes(&base).unwrap();
        assert!(changes.added.iter().any(|p| p.ends_with("new.txt")));
        assert!(changes.modified.iter().any(|p| p.ends_with("keep.txt")));

        let merged = sandbox.merge_back(&changes).unwrap();
        assert_eq!(merged, 2);
        assert_eq!(
            fs::read_to_string(repo.path().join("new.txt")).unwrap(),
            "fresh\n"
        );
        assert_eq!(
            fs::read_to_string(repo.path().join("keep.txt")).unwrap(),
            "edited\n"
        );

        sandbox.remove_worktree().unwrap();
    }

    #[test]
    fn test_sandbox_mutations_do_not_touch_main_repo() {
        let repo = setup_repo();
        let mut sandbox = Sandbox::create_worktree(repo.path(), &Uuid::new_v4(), None).unwrap();
        fs::write(sandbox.path().join("isolated.txt"), "only here\n").unwrap();
        assert!(!repo.path().join("isolated.txt").exists());
        sandbox.remove_worktree().unwrap();
    }
}
