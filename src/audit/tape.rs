//! The run tape: a line-oriented JSONL event stream plus a directory of
//! per-step snapshot files.
//!
//! Events are flushed as they occur and never rewritten. Step boundaries
//! optionally trigger a checksum snapshot over the working tree, persisted
//! separately from the event stream and addressable by step id.

use super::{AuditEvent, EventKind, StepSnapshot};
use crate::checksum::checksum_tree;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct RunTape {
    tape_path: PathBuf,
    snapshots_dir: PathBuf,
}

impl RunTape {
    /// Open (or create) the tape for one execution's run directory.
    pub fn new(run_dir: &Path) -> Result<Self> {
        let snapshots_dir = run_dir.join("snapshots");
        std::fs::create_dir_all(&snapshots_dir)
            .context("Failed to create snapshots directory")?;
        Ok(Self {
            tape_path: run_dir.join("tape.jsonl"),
            snapshots_dir,
        })
    }

    /// Append one event to the tape. The file is opened in append mode and
    /// flushed per event so a crash never loses acknowledged history.
    pub fn log_event(
        &mut self,
        event: EventKind,
        operation_id: Option<&str>,
        details: serde_json::Value,
    ) -> Result<()> {
        let record = AuditEvent::new(event, operation_id, details);
        let line = serde_json::to_string(&record).context("Failed to serialize audit event")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.tape_path)
            .context("Failed to open run tape")?;
        writeln!(file, "{line}").context("Failed to append to run tape")?;
        file.flush().context("Failed to flush run tape")?;
        Ok(())
    }

    /// Mark the beginning of a step.
    pub fn start_step(&mut self, step_id: &str) -> Result<()> {
        self.log_event(
            EventKind::StepStarted,
            Some(step_id),
            serde_json::json!({ "step_id": step_id }),
        )
    }

    /// Mark the end of a step. When `snapshot_root` is given, a checksum
    /// snapshot of that tree is persisted under the step id.
    pub fn end_step(
        &mut self,
        step_id: &str,
        snapshot_root: Option<&Path>,
    ) -> Result<Option<StepSnapshot>> {
        let snapshot = match snapshot_root {
            Some(root) => {
                let snapshot = StepSnapshot {
                    step_id: step_id.to_string(),
                    at: Utc::now(),
                    checksums: checksum_tree(root)?,
                };
                let path = self.snapshot_path(step_id);
                let json = serde_json::to_string_pretty(&snapshot)
                    .context("Failed to serialize step snapshot")?;
                std::fs::write(&path, json).context("Failed to write step snapshot")?;
                Some(snapshot)
            }
            None => None,
        };
        self.log_event(
            EventKind::StepCompleted,
            Some(step_id),
            serde_json::json!({
                "step_id": step_id,
                "snapshot": snapshot.is_some(),
            }),
        )?;
        Ok(snapshot)
    }

    /// Load a persisted step snapshot, if one exists.
    pub fn get_snapshot(&self, step_id: &str) -> Result<Option<StepSnapshot>> {
        let path = self.snapshot_path(step_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        let snapshot = serde_json::from_str(&content).context("Failed to parse step snapshot")?;
        Ok(Some(snapshot))
    }

    /// Re-read the full event stream from disk, in write order.
    pub fn get_events(&self) -> Result<Vec<AuditEvent>> {
        if !self.tape_path.exists() {
            return Ok(Vec::new());
        }
        let content =
            std::fs::read_to_string(&self.tape_path).context("Failed to read run tape")?;
        let mut events = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(line)
                .with_context(|| format!("Malformed tape line {}", n + 1))?;
            events.push(event);
        }
        Ok(events)
    }

    fn snapshot_path(&self, step_id: &str) -> PathBuf {
        self.snapshots_dir.join(format!("{step_id}.json"))
    }
}

/// Shared handle used when concurrent operation workers need to log.
/// Mutex poisoning is surfaced as an error instead of panicking.
#[derive(Clone)]
pub struct TapeHandle(Arc<Mutex<RunTape>>);

impl TapeHandle {
    pub fn new(tape: RunTape) -> Self {
        Self(Arc::new(Mutex::new(tape)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, RunTape>> {
        self.0.lock().map_err(|_| anyhow!("run tape mutex poisoned"))
    }

    pub fn log_event(
        &self,
        event: EventKind,
        operation_id: Option<&str>,
        details: serde_json::Value,
    ) -> Result<()> {
        self.lock()?.log_event(event, operation_id, details)
    }

    pub fn start_step(&self, step_id: &str) -> Result<()> {
        self.lock()?.start_step(step_id)
    }

    pub fn end_step(
        &self,
        step_id: &str,
        snapshot_root: Option<&Path>,
    ) -> Result<Option<StepSnapshot>> {
        self.lock()?.end_step(step_id, snapshot_root)
    }

    pub fn get_snapshot(&self, step_id: &str) -> Result<Option<StepSnapshot>> {
        self.lock()?.get_snapshot(step_id)
    }

    pub fn get_events(&self) -> Result<Vec<AuditEvent>> {
        self.lock()?.get_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (RunTape, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let tape = RunTape::new(dir.path()).unwrap();
        (tape, dir)
    }

    #[test]
    fn test_events_append_in_order() {
        let (mut tape, _dir) = setup();
        tape.log_event(EventKind::ExecutionReceived, None, serde_json::json!({}))
            .unwrap();
        tape.log_event(
            EventKind::OperationStarted,
            Some("op-1"),
            serde_json::json!({}),
        )
        .unwrap();
        tape.log_event(
            EventKind::OperationCompleted,
            Some("op-1"),
            serde_json::json!({}),
        )
        .unwrap();

        let events = tape.get_events().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event, EventKind::ExecutionReceived);
        assert_eq!(events[1].operation_id.as_deref(), Some("op-1"));
        assert_eq!(events[2].event, EventKind::OperationCompleted);
    }

    #[test]
    fn test_tape_is_append_only_across_instances() {
        let dir = tempdir().unwrap();
        {
            let mut tape = RunTape::new(dir.path()).unwrap();
            tape.log_event(EventKind::ExecutionReceived, None, serde_json::json!({}))
                .unwrap();
        }
        {
            let mut tape = RunTape::new(dir.path()).unwrap();
            tape.log_event(EventKind::ExecutionCompleted, None, serde_json::json!({}))
                .unwrap();
        }
        let tape = RunTape::new(dir.path()).unwrap();
        let events = tape.get_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, EventKind::ExecutionReceived);
        assert_eq!(events[1].event, EventKind::ExecutionCompleted);
    }

    #[test]
    fn test_end_step_writes_snapshot() {
        let dir = tempdir().unwrap();
        let tree = tempdir().unwrap();
        std::fs::write(tree.path().join("file.txt"), "content").unwrap();

        let mut tape = RunTape::new(dir.path()).unwrap();
        tape.start_step("step-1").unwrap();
        let snapshot = tape.end_step("step-1", Some(tree.path())).unwrap().unwrap();
        assert!(snapshot.checksums.contains_key("file.txt"));

        let loaded = tape.get_snapshot("step-1").unwrap().unwrap();
        assert_eq!(loaded.checksums, snapshot.checksums);
    }

    #[test]
    fn test_end_step_without_snapshot() {
        let (mut tape, _dir) = setup();
        tape.start_step("s").unwrap();
        let snapshot = tape.end_step("s", None).unwrap();
        assert!(snapshot.is_none());
        assert!(tape.get_snapshot("s").unwrap().is_none());
    }

    #[test]
    fn test_get_events_on_missing_tape() {
        let dir = tempdir().unwrap();
        let tape = RunTape::new(dir.path()).unwrap();
        assert!(tape.get_events().unwrap().is_empty());
    }

    #[test]
    fn test_handle_is_cloneable_and_logs() {
        let (tape, _dir) = setup();
        let handle = TapeHandle::new(tape);
        let clone = handle.clone();
        clone
            .log_event(EventKind::LockAcquired, None, serde_json::json!({}))
            .unwrap();
        assert_eq!(handle.get_events().unwrap().len(), 1);
    }
}
