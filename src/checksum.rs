//! Content checksums over a working tree.
//!
//! Rollback points and step snapshots both record a map of relative file
//! path to SHA-256 digest. Verification always recomputes a fresh map and
//! compares; recorded checksums are never recomputed in place.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

/// Directories never included in a checksum map.
const EXCLUDED_DIRS: &[&str] = &[".git", ".warden"];

/// Compute the SHA-256 hex digest of a single file.
pub fn file_checksum(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute checksums for every file under `root`, keyed by relative path
/// with forward-slash separators. `.git` and warden state are excluded.
pub fn checksum_tree(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();

    let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
        e.file_name()
            .to_str()
            .map(|name| !EXCLUDED_DIRS.contains(&name))
            .unwrap_or(true)
    });

    for entry in walker {
        let entry = entry.context("Failed to walk working tree")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .context("Walked path outside root")?;
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        map.insert(key, file_checksum(entry.path())?);
    }

    Ok(map)
}

/// Compare a recorded checksum map against a freshly computed one.
/// Returns the relative paths that differ (missing, extra, or changed).
pub fn diff_checksums(
    recorded: &BTreeMap<String, String>,
    fresh: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut mismatched = Vec::new();
    for (path, sum) in recorded {
        match fresh.get(path) {
            Some(current) if current == sum => {}
            _ => mismatched.push(path.clone()),
        }
    }
    for path in fresh.keys() {
        if !recorded.contains_key(path) {
            mismatched.push(path.clone());
        }
    }
    mismatched.sort();
    mismatched.dedup();
    mismatched
}

/// Stable fingerprint of a repository path, used to key execution locks.
pub fn repo_fingerprint(repo_path: &Path) -> String {
    let canonical = repo_path
        .canonicalize()
        .unwrap_or_else(|_| repo_path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}
