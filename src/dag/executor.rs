//! Bounded-concurrency execution of the operation graph.
//!
//! The executor fans out up to `max_concurrency` workers for independent
//! operations and fans back in before the engine proceeds to audit and
//! result assembly. A failed operation never aborts siblings, but every
//! transitive dependent is skipped without starting.
//!
//! A separate linear mode runs operations strictly in input order and stops
//! the batch at the first failure. It is a distinct, selectable mode, not a
//! special case of the DAG path.

use crate::dag::scheduler::{OpScheduler, OperationStatus};
use crate::errors::OperationError;
use crate::request::{OperationOutcome, OperationSpec};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, Semaphore};

/// The seam between scheduling and doing. The engine supplies an
/// implementation that checks the allow-list, dispatches the handler and
/// emits audit events per operation.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Called in dispatch order, before the operation is handed to a
    /// worker. Start-of-operation bookkeeping belongs here so the start
    /// order recorded for simultaneously eligible operations is the
    /// declared input order, not worker wakeup order.
    fn begin(&self, _op: &OperationSpec) -> Result<(), OperationError> {
        Ok(())
    }

    async fn execute(&self, op: &OperationSpec) -> Result<serde_json::Value, OperationError>;
}

pub struct DagExecutor {
    max_concurrency: usize,
}

impl DagExecutor {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Execute the graph with bounded concurrency.
    ///
    /// Returns `Ok((success, outcomes))` with one outcome per operation in
    /// declared input order. Graph validation errors (cycles, unknown or
    /// duplicate ids) return `Err` before any executor invocation.
    pub async fn execute_parallel(
        &self,
        operations: &[OperationSpec],
        executor: Arc<dyn OperationExecutor>,
    ) -> Result<(bool, Vec<OperationOutcome>)> {
        let scheduler = OpScheduler::from_operations(operations)?;
        if scheduler.is_empty() {
            return Ok((true, Vec::new()));
        }

        let scheduler = Arc::new(Mutex::new(scheduler));
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let (result_tx, mut result_rx) =
            mpsc::channel::<(usize, Result<serde_json::Value, OperationError>, u64)>(
                operations.len(),
            );

        let mut outcomes: Vec<Option<OperationOutcome>> = vec![None; operations.len()];
        let mut active = 0usize;

        loop {
            // Release newly eligible operations, in declared input order.
            let ready: Vec<(usize, OperationSpec)> = {
                let mut sched = scheduler.lock().await;
                let indices = sched.ready();
                let mut batch = Vec::with_capacity(indices.len());
                for i in indices {
                    if let Some(op) = sched.operation(i) {
                        batch.push((i, op.clone()));
                    }
                }
                for (i, _) in &batch {
                    sched.mark_running(*i);
                }
                batch
            };

            for (index, op) in ready {
                // Permit acquisition and `begin` happen here, in dispatch
                // order, so starts of simultaneously eligible operations are
                // recorded in declared input order. Running workers keep
                // draining into the buffered result channel while this loop
                // waits for a permit, so waiting here cannot deadlock.
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| anyhow!("operation semaphore closed unexpectedly"))?;

                if let Err(e) = executor.begin(&op) {
                    let message = e.to_string();
                    let mut sched = scheduler.lock().await;
                    sched.mark_failed(index, &message);
                    outcomes[index] =
                        Some(OperationOutcome::failure(&op.id, op.kind, &message, 0));
                    continue;
                }

                let executor = executor.clone();
                let result_tx = result_tx.clone();
                active += 1;

                tokio::spawn(async move {
                    let _permit = permit;
                    let timer = Instant::now();
                    let result = executor.execute(&op).await;
                    let elapsed_ms = timer.elapsed().as_millis() as u64;
                    result_tx.send((index, result, elapsed_ms)).await.ok();
                });
            }

            if active == 0 {
                let sched = scheduler.lock().await;
                if sched.all_terminal() || sched.ready().is_empty() {
                    break;
                }
                continue;
            }

            let (index, result, elapsed_ms) = result_rx
                .recv()
                .await
                .ok_or_else(|| anyhow!("operation result channel closed unexpectedly"))?;
            active -= 1;

            let op = &operations[index];
            let mut sched = scheduler.lock().await;
            match result {
                Ok(_) => {
                    sched.mark_completed(index);
                    outcomes[index] =
                        Some(OperationOutcome::success(&op.id, op.kind, elapsed_ms));
                }
                Err(e) => {
                    let message = e.to_string();
                    sched.mark_failed(index, &message);
                    outcomes[index] =
                        Some(OperationOutcome::failure(&op.id, op.kind, &message, elapsed_ms));
                }
            }
        }

        // Fill in skipped operations so the caller sees the full map.
        let sched = scheduler.lock().await;
        let mut final_outcomes = Vec::with_capacity(operations.len());
        for (i, op) in operations.iter().enumerate() {
            let outcome = match outcomes[i].take() {
                Some(outcome) => outcome,
                None => {
                    debug_assert_eq!(*sched.status(i), OperationStatus::Skipped);
                    OperationOutcome::failure(
                        &op.id,
                        op.kind,
                        "skipped: blocked by failed dependency",
                        0,
                    )
                }
            };
            final_outcomes.push(outcome);
        }

        Ok((sched.all_success(), final_outcomes))
    }

    /// Backward-compatible linear mode: strict input order, first failure
    /// stops the batch immediately.
    pub async fn execute_linear(
        &self,
        operations: &[OperationSpec],
        executor: Arc<dyn OperationExecutor>,
    ) -> Result<(bool, Vec<OperationOutcome>)> {
        let mut outcomes = Vec::with_capacity(operations.len());
        let mut failed_at: Option<usize> = None;

        for (i, op) in operations.iter().enumerate() {
            let timer = Instant::now();
            let result = match executor.begin(op) {
                Ok(()) => executor.execute(op).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {
                    outcomes.push(OperationOutcome::success(
                        &op.id,
                        op.kind,
                        timer.elapsed().as_millis() as u64,
                    ));
                }
                Err(e) => {
                    outcomes.push(OperationOutcome::failure(
                        &op.id,
                        op.kind,
                        &e.to_string(),
                        timer.elapsed().as_millis() as u64,
                    ));
                    failed_at = Some(i);
                    break;
                }
            }
        }

        if let Some(i) = failed_at {
            for op in &operations[i + 1..] {
                outcomes.push(OperationOutcome::failure(
                    &op.id,
                    op.kind,
                    "skipped: batch stopped at earlier failure",
                    0,
                ));
            }
            return Ok((false, outcomes));
        }

        Ok((true, outcomes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::OperationKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn op(id: &str, deps: Vec<&str>) -> OperationSpec {
        OperationSpec {
            id: id.to_string(),
            kind: OperationKind::WriteFile,
            params: serde_json::Value::Null,
            depends_on: deps.into_iter().map(String::from).collect(),
        }
    }

    /// Test double that records invocation order and can fail chosen ops.
    struct RecordingExecutor {
        began: std::sync::Mutex<Vec<String>>,
        invoked: Mutex<Vec<String>>,
        fail_ids: Vec<String>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl RecordingExecutor {
        fn new(fail_ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                began: std::sync::Mutex::new(Vec::new()),
                invoked: Mutex::new(Vec::new()),
                fail_ids: fail_ids.iter().map(|s| s.to_string()).collect(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::from_millis(20),
            })
        }

        fn began(&self) -> Vec<String> {
            self.began.lock().unwrap().clone()
        }

        async fn invoked(&self) -> Vec<String> {
            self.invoked.lock().await.clone()
        }
    }

    #[async_trait]
    impl OperationExecutor for RecordingExecutor {
        fn begin(&self, op: &OperationSpec) -> Result<(), OperationError> {
            self.began.lock().unwrap().push(op.id.clone());
            Ok(())
        }

        async fn execute(&self, op: &OperationSpec) -> Result<serde_json::Value, OperationError> {
            self.invoked.lock().await.push(op.id.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_ids.contains(&op.id) {
                return Err(OperationError::InvalidParams(format!(
                    "injected failure for {}",
                    op.id
                )));
            }
            Ok(serde_json::json!({"id": op.id}))
        }
    }

    #[tokio::test]
    async fn test_independent_operations_run_concurrently() {
        let ops = vec![op("a", vec![]), op("b", vec![]), op("c", vec![])];
        let executor = RecordingExecutor::new(&[]);
        let dag = DagExecutor::new(5);

        let (success, outcomes) = dag
            .execute_parallel(&ops, executor.clone())
            .await
            .unwrap();

        assert!(success);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.success));
        assert!(executor.max_in_flight.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let ops = vec![
            op("a", vec![]),
            op("b", vec![]),
            op("c", vec![]),
            op("d", vec![]),
        ];
        let executor = RecordingExecutor::new(&[]);
        let dag = DagExecutor::new(1);

        let (success, _) = dag
            .execute_parallel(&ops, executor.clone())
            .await
            .unwrap();

        assert!(success);
        assert_eq!(executor.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependent_only() {
        // b depends on a (which fails); c is independent.
        let ops = vec![op("a", vec![]), op("b", vec!["a"]), op("c", vec![])];
        let executor = RecordingExecutor::new(&["a"]);
        let dag = DagExecutor::new(5);

        let (success, outcomes) = dag
            .execute_parallel(&ops, executor.clone())
            .await
            .unwrap();

        assert!(!success);
        let invoked = executor.invoked().await;
        assert!(!invoked.contains(&"b".to_string()), "b must never start");
        assert!(invoked.contains(&"c".to_string()));

        assert!(!outcomes[0].success);
        assert!(outcomes[1]
            .error
            .as_deref()
            .unwrap()
            .contains("skipped"));
        assert!(outcomes[2].success);
    }

    #[tokio::test]
    async fn test_cycle_fails_with_zero_invocations() {
        let ops = vec![op("a", vec!["b"]), op("b", vec!["a"])];
        let executor = RecordingExecutor::new(&[]);
        let dag = DagExecutor::new(5);

        let result = dag.execute_parallel(&ops, executor.clone()).await;
        assert!(result.is_err());
        assert!(executor.invoked().await.is_empty());
    }

    #[tokio::test]
    async fn test_dependency_order_respected() {
        let ops = vec![op("a", vec![]), op("b", vec!["a"]), op("c", vec!["b"])];
        let executor = RecordingExecutor::new(&[]);
        let dag = DagExecutor::new(5);

        let (success, _) = dag
            .execute_parallel(&ops, executor.clone())
            .await
            .unwrap();

        assert!(success);
        assert_eq!(executor.invoked().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_deterministic_ordering_across_runs() {
        let ops = vec![
            op("root", vec![]),
            op("left", vec!["root"]),
            op("right", vec!["root"]),
            op("join", vec!["left", "right"]),
        ];
        let dag = DagExecutor::new(1);

        let first = RecordingExecutor::new(&[]);
        dag.execute_parallel(&ops, first.clone()).await.unwrap();
        let second = RecordingExecutor::new(&[]);
        dag.execute_parallel(&ops, second.clone()).await.unwrap();

        assert_eq!(first.invoked().await, second.invoked().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_start_order_is_input_order_at_high_concurrency() {
        // All four operations are eligible at once; starts must still be
        // recorded in declared input order, not worker wakeup order.
        let ops = vec![
            op("a", vec![]),
            op("b", vec![]),
            op("c", vec![]),
            op("d", vec![]),
        ];
        let dag = DagExecutor::new(5);

        for _ in 0..5 {
            let executor = RecordingExecutor::new(&[]);
            let (success, _) = dag
                .execute_parallel(&ops, executor.clone())
                .await
                .unwrap();
            assert!(success);
            assert_eq!(executor.began(), vec!["a", "b", "c", "d"]);
        }
    }

    #[tokio::test]
    async fn test_empty_graph_succeeds() {
        let dag = DagExecutor::new(5);
        let executor = RecordingExecutor::new(&[]);
        let (success, outcomes) = dag.execute_parallel(&[], executor).await.unwrap();
        assert!(success);
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_linear_mode_stops_at_first_failure() {
        let ops = vec![op("a", vec![]), op("b", vec![]), op("c", vec![])];
        let executor = RecordingExecutor::new(&["b"]);
        let dag = DagExecutor::new(5);

        let (success, outcomes) = dag
            .execute_linear(&ops, executor.clone())
            .await
            .unwrap();

        assert!(!success);
        assert_eq!(executor.invoked().await, vec!["a", "b"]);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(outcomes[2].error.as_deref().unwrap().contains("skipped"));
    }

    #[tokio::test]
    async fn test_linear_mode_runs_in_input_order() {
        let ops = vec![op("z", vec![]), op("a", vec![]), op("m", vec![])];
        let executor = RecordingExecutor::new(&[]);
        let dag = DagExecutor::new(5);

        let (success, _) = dag.execute_linear(&ops, executor.clone()).await.unwrap();
        assert!(success);
        assert_eq!(executor.invoked().await, vec!["z", "a", "m"]);
    }
}
