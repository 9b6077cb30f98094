//! Advisory execution lock keyed by (execution id, repository fingerprint).
//!
//! The lock is a persisted marker file, not an in-process mutex, so it
//! survives process restarts and correctly rejects a second acquire for the
//! same fingerprint while the first is outstanding. Acquisition uses
//! `create_new` so exactly one writer wins.

use crate::errors::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMarker {
    pub execution_id: Uuid,
    pub fingerprint: String,
    pub acquired_at: DateTime<Utc>,
    pub pid: u32,
}

/// Store of lock marker files, one per repository fingerprint.
#[derive(Debug, Clone)]
pub struct LockStore {
    locks_dir: PathBuf,
}

impl LockStore {
    pub fn new(locks_dir: &Path) -> Self {
        Self {
            locks_dir: locks_dir.to_path_buf(),
        }
    }

    fn marker_path(&self, fingerprint: &str) -> PathBuf {
        self.locks_dir.join(format!("{fingerprint}.lock"))
    }

    /// Try to acquire the lock. Returns `Ok(false)` when another execution
    /// already holds it; the caller treats that as a terminal failure and
    /// never retries internally.
    pub fn acquire(&self, execution_id: &Uuid, fingerprint: &str) -> Result<bool, EngineError> {
        std::fs::create_dir_all(&self.locks_dir).map_err(|source| EngineError::LockStore {
            path: self.locks_dir.clone(),
            source,
        })?;

        let path = self.marker_path(fingerprint);
        let marker = LockMarker {
            execution_id: *execution_id,
            fingerprint: fingerprint.to_string(),
            acquired_at: Utc::now(),
            pid: std::process::id(),
        };

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(&marker)
                    .map_err(|e| EngineError::Other(e.into()))?;
                file.write_all(json.as_bytes())
                    .map_err(|source| EngineError::LockStore {
                        path: path.clone(),
                        source,
                    })?;
                tracing::info!(%execution_id, fingerprint, "execution lock acquired");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::warn!(%execution_id, fingerprint, "execution lock contended");
                Ok(false)
            }
            Err(source) => Err(EngineError::LockStore { path, source }),
        }
    }

    /// Release the lock. Idempotent: releasing a lock that is absent or held
    /// by a different execution only logs, never errors.
    pub fn release(&self, execution_id: &Uuid, fingerprint: &str) -> Result<(), EngineError> {
        let path = self.marker_path(fingerprint);
        match self.read_marker(&path) {
            Some(marker) if marker.execution_id == *execution_id => {
                std::fs::remove_file(&path).map_err(|source| EngineError::LockStore {
                    path: path.clone(),
                    source,
                })?;
                tracing::info!(%execution_id, fingerprint, "execution lock released");
            }
            Some(marker) => {
                tracing::warn!(
                    %execution_id,
                    holder = %marker.execution_id,
                    fingerprint,
                    "release requested for a lock held by another execution; leaving it in place"
                );
            }
            None => {
                tracing::warn!(%execution_id, fingerprint, "release requested for an absent lock");
            }
        }
        Ok(())
    }

    /// Inspect the current holder, if any.
    pub fn holder(&self, fingerprint: &str) -> Option<LockMarker> {
        self.read_marker(&self.marker_path(fingerprint))
    }

    fn read_marker(&self, path: &Path) -> Option<LockMarker> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }
}
