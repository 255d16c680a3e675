//! In-process queue of long-running control-plane operations.
//!
//! Route handlers [`enqueue`](OperationQueue::enqueue) mutations and return
//! the [`OperationId`] to the browser, which then polls
//! [`status`](OperationQueue::status). A single background worker executes the
//! queue strictly in submission order, one operation at a time; the remote
//! control plane holds per-project and per-cluster locks, so running mutations
//! concurrently only produces conflict errors.
//!
//! Queue bookkeeping sits behind one mutex that is never held across the
//! remote call. Each operation executes in its own task so a panicking client
//! fails that operation instead of killing the worker.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use atlas_console_core::OperationId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};

use crate::client::ControlPlaneClient;
use crate::error::{ControlError, Result};
use crate::executor;
use crate::lifecycle;

/// Kinds of queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create a project in an organization.
    CreateProject,
    /// Delete a project.
    DeleteProject,
    /// Create a cluster in a project.
    CreateCluster,
    /// Delete a cluster.
    DeleteCluster,
}

impl OperationKind {
    /// The snake_case name used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateProject => "create_project",
            Self::DeleteProject => "delete_project",
            Self::CreateCluster => "create_cluster",
            Self::DeleteCluster => "delete_cluster",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for the worker.
    Queued,
    /// Being executed by the worker.
    Running,
    /// The remote call succeeded.
    Succeeded,
    /// The remote call, or metadata decoding, failed.
    Failed,
}

/// A queued operation and its progress.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    /// Unique identifier.
    pub id: OperationId,
    /// What the operation does.
    pub kind: OperationKind,
    /// Label shown in the UI.
    pub display_name: String,
    /// Execution payload.
    pub metadata: Map<String, Value>,
    /// Current status.
    pub status: OperationStatus,
    /// Last progress line reported by the executor.
    pub progress: Option<String>,
    /// When the operation was enqueued.
    pub submitted_at: DateTime<Utc>,
    /// When the worker picked it up.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure message; present only when failed.
    pub error: Option<String>,
    /// Remote response body; present only when succeeded.
    pub result: Option<Value>,
}

#[derive(Default)]
struct QueueState {
    records: HashMap<OperationId, OperationRecord>,
    // Every known id, oldest first.
    order: VecDeque<OperationId>,
    pending: VecDeque<OperationId>,
    running: Option<OperationId>,
    // Task executing `running`; aborted when the worker is abandoned.
    execution: Option<AbortHandle>,
}

impl QueueState {
    fn evict_finished(&mut self, max_history: usize) {
        let finished = self
            .records
            .values()
            .filter(|record| lifecycle::is_terminal(record.status))
            .count();
        let mut excess = finished.saturating_sub(max_history);
        if excess == 0 {
            return;
        }

        let records = &mut self.records;
        self.order.retain(|id| {
            if excess > 0 && records.get(id).is_some_and(|r| lifecycle::is_terminal(r.status)) {
                records.remove(id);
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

#[derive(Default)]
struct WorkerState {
    handle: Option<JoinHandle<()>>,
    stopped: bool,
}

/// FIFO queue of control-plane operations with a single worker.
pub struct OperationQueue {
    state: Mutex<QueueState>,
    worker: Mutex<WorkerState>,
    notify: Notify,
    shutdown: watch::Sender<bool>,
    client: Arc<dyn ControlPlaneClient>,
    max_history: usize,
}

impl OperationQueue {
    /// Create a stopped queue executing against `client`, keeping at most
    /// `max_history` finished operations.
    #[must_use]
    pub fn new(client: Arc<dyn ControlPlaneClient>, max_history: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Mutex::new(QueueState::default()),
            worker: Mutex::new(WorkerState::default()),
            notify: Notify::new(),
            shutdown,
            client,
            max_history,
        }
    }

    /// Append an operation to the queue and return its id.
    ///
    /// Never waits on remote I/O. The metadata is not inspected here; a
    /// payload that does not fit `kind` fails when executed.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        display_name: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> OperationId {
        let id = OperationId::generate();
        let record = OperationRecord {
            id,
            kind,
            display_name: display_name.into(),
            metadata,
            status: OperationStatus::Queued,
            progress: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            result: None,
        };

        {
            let mut state = self.state.lock();
            tracing::info!(
                operation_id = %id,
                kind = %kind,
                display_name = %record.display_name,
                queued = state.pending.len(),
                "Enqueued operation"
            );
            state.records.insert(id, record);
            state.order.push_back(id);
            state.pending.push_back(id);
        }

        self.notify.notify_one();
        id
    }

    /// Validate the metadata for `kind`, then enqueue.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidMetadata` without enqueueing anything if
    /// the metadata does not fit the kind.
    pub fn submit(
        &self,
        kind: OperationKind,
        display_name: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Result<OperationId> {
        executor::check_metadata(kind, &metadata)?;
        Ok(self.enqueue(kind, display_name, metadata))
    }

    /// Snapshot of one operation.
    #[must_use]
    pub fn status(&self, id: &OperationId) -> Option<OperationRecord> {
        self.state.lock().records.get(id).cloned()
    }

    /// Snapshot of every retained operation, in submission order.
    #[must_use]
    pub fn list(&self) -> Vec<OperationRecord> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .cloned()
            .collect()
    }

    /// Number of operations waiting for the worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether the worker task is currently alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start the worker on the current tokio runtime.
    ///
    /// Returns `Ok(true)` if a worker was spawned and `Ok(false)` if one was
    /// already running.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvariantViolation` if the queue was stopped.
    pub fn start(self: &Arc<Self>) -> Result<bool> {
        let mut worker = self.worker.lock();
        if worker.stopped {
            return Err(ControlError::InvariantViolation(
                "operation worker cannot be restarted after stop".to_string(),
            ));
        }
        if worker.handle.is_some() {
            tracing::debug!("Operation worker already running");
            return Ok(false);
        }

        let shutdown = self.shutdown.subscribe();
        worker.handle = Some(tokio::spawn(Arc::clone(self).run_worker(shutdown)));
        Ok(true)
    }

    /// Stop the worker after its current operation.
    ///
    /// Waits up to `grace` for the in-flight operation. If it does not finish
    /// in time the worker and its execution task are aborted and the operation
    /// is marked failed. Queued operations stay queued. Returns whether the
    /// worker exited within the grace period.
    pub async fn stop(&self, grace: Duration) -> bool {
        let handle = {
            let mut worker = self.worker.lock();
            worker.stopped = true;
            worker.handle.take()
        };
        self.shutdown.send_replace(true);

        let Some(mut handle) = handle else {
            return true;
        };

        if tokio::time::timeout(grace, &mut handle).await.is_ok() {
            tracing::info!(pending = self.pending(), "Operation worker stopped");
            true
        } else {
            handle.abort();
            self.abandon_running();
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "Operation worker did not stop within grace period, abandoned"
            );
            false
        }
    }

    async fn run_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Operation worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Some((id, kind, metadata)) = self.dequeue() {
                self.execute(id, kind, metadata).await;
                continue;
            }

            tokio::select! {
                () = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Operation worker exiting");
    }

    /// Pop the next queued operation and mark it running.
    fn dequeue(&self) -> Option<(OperationId, OperationKind, Map<String, Value>)> {
        let mut state = self.state.lock();
        while let Some(id) = state.pending.pop_front() {
            let Some(record) = state.records.get_mut(&id) else {
                continue;
            };
            if let Err(e) =
                lifecycle::validate_operation_transition(&id, record.status, OperationStatus::Running)
            {
                tracing::error!(error = %e, "Skipping operation in unexpected state");
                continue;
            }

            record.status = OperationStatus::Running;
            record.started_at = Some(Utc::now());
            let next = (id, record.kind, record.metadata.clone());
            state.running = Some(id);
            return Some(next);
        }
        None
    }

    async fn execute(self: &Arc<Self>, id: OperationId, kind: OperationKind, metadata: Map<String, Value>) {
        tracing::info!(operation_id = %id, kind = %kind, "Executing operation");

        let client = Arc::clone(&self.client);
        let queue = Arc::clone(self);
        let task = tokio::spawn(async move {
            let report = move |line: String| queue.set_progress(&id, line);
            executor::execute(client.as_ref(), kind, &metadata, &report).await
        });
        self.state.lock().execution = Some(task.abort_handle());

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(ControlError::Internal(
                "operation executor panicked".to_string(),
            )),
            Err(e) => Err(ControlError::Internal(format!(
                "operation executor cancelled: {e}"
            ))),
        };

        self.finish(&id, outcome);
    }

    fn set_progress(&self, id: &OperationId, line: String) {
        let mut state = self.state.lock();
        if let Some(record) = state.records.get_mut(id) {
            if record.status == OperationStatus::Running {
                record.progress = Some(line);
            }
        }
    }

    fn finish(&self, id: &OperationId, outcome: Result<Value>) {
        let mut state = self.state.lock();
        if state.running == Some(*id) {
            state.running = None;
            state.execution = None;
        }

        let Some(record) = state.records.get_mut(id) else {
            return;
        };
        let target = if outcome.is_ok() {
            OperationStatus::Succeeded
        } else {
            OperationStatus::Failed
        };
        if let Err(e) = lifecycle::validate_operation_transition(id, record.status, target) {
            tracing::error!(error = %e, "Dropping outcome of operation");
            return;
        }

        record.status = target;
        record.finished_at = Some(Utc::now());
        match outcome {
            Ok(value) => {
                tracing::info!(
                    operation_id = %id,
                    kind = %record.kind,
                    "Operation succeeded"
                );
                record.progress = Some("Completed".to_string());
                record.result = Some(value);
            }
            Err(e) => {
                tracing::error!(
                    operation_id = %id,
                    kind = %record.kind,
                    error = %e,
                    "Operation failed"
                );
                record.progress = Some("Failed".to_string());
                record.error = Some(e.to_string());
            }
        }

        state.evict_finished(self.max_history);
    }

    fn abandon_running(&self) {
        let (running, execution) = {
            let mut state = self.state.lock();
            (state.running, state.execution.take())
        };
        if let Some(execution) = execution {
            execution.abort();
        }
        if let Some(id) = running {
            self.finish(
                &id,
                Err(ControlError::Internal("abandoned at shutdown".to_string())),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::client::mock::MockControlPlaneClient;

    fn metadata(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("metadata must be an object"),
        }
    }

    fn queue(client: &Arc<MockControlPlaneClient>) -> Arc<OperationQueue> {
        let client: Arc<dyn ControlPlaneClient> = client.clone();
        Arc::new(OperationQueue::new(client, 500))
    }

    async fn wait_terminal(queue: &OperationQueue, id: &OperationId) -> OperationRecord {
        for _ in 0..500 {
            let record = queue.status(id).unwrap();
            if lifecycle::is_terminal(record.status) {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("operation {id} did not finish");
    }

    #[test]
    fn enqueue_without_worker_stays_queued() {
        let client = Arc::new(MockControlPlaneClient::new());
        let queue = queue(&client);

        let id = queue.enqueue(
            OperationKind::CreateProject,
            "Create p1",
            metadata(json!({ "name": "p1", "org_id": "o1" })),
        );

        let record = queue.status(&id).unwrap();
        assert_eq!(record.status, OperationStatus::Queued);
        assert_eq!(record.display_name, "Create p1");
        assert!(record.started_at.is_none());
        assert_eq!(queue.pending(), 1);
        assert!(queue.status(&OperationId::generate()).is_none());
    }

    #[test]
    fn submit_rejects_bad_metadata() {
        let client = Arc::new(MockControlPlaneClient::new());
        let queue = queue(&client);

        let result = queue.submit(OperationKind::CreateProject, "Create", metadata(json!({ "name": "p1" })));
        assert!(matches!(result, Err(ControlError::InvalidMetadata { .. })));
        assert!(queue.list().is_empty());
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(OperationKind::DeleteCluster).unwrap(),
            json!("delete_cluster")
        );
        assert_eq!(OperationKind::CreateProject.to_string(), "create_project");
    }

    #[tokio::test]
    async fn worker_executes_operation() {
        let client = Arc::new(MockControlPlaneClient::new());
        let queue = queue(&client);
        assert!(queue.start().unwrap());

        let id = queue.enqueue(
            OperationKind::CreateProject,
            "Create p1",
            metadata(json!({ "name": "p1", "org_id": "o1" })),
        );
        let record = wait_terminal(&queue, &id).await;

        assert_eq!(record.status, OperationStatus::Succeeded);
        assert_eq!(record.result.unwrap()["name"], "p1");
        assert!(record.error.is_none());
        assert!(record.started_at.unwrap() <= record.finished_at.unwrap());

        assert!(queue.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_not_restartable() {
        let client = Arc::new(MockControlPlaneClient::new());
        let queue = queue(&client);

        assert!(queue.start().unwrap());
        assert!(!queue.start().unwrap());
        assert!(queue.is_running());

        assert!(queue.stop(Duration::from_secs(1)).await);
        assert!(!queue.is_running());
        assert!(matches!(queue.start(), Err(ControlError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn invalid_metadata_fails_operation() {
        let client = Arc::new(MockControlPlaneClient::new());
        let queue = queue(&client);
        queue.start().unwrap();

        let id = queue.enqueue(OperationKind::DeleteCluster, "Delete", Map::new());
        let record = wait_terminal(&queue, &id).await;

        assert_eq!(record.status, OperationStatus::Failed);
        assert!(record.error.unwrap().starts_with("invalid metadata for delete_cluster"));
        assert!(client.calls().is_empty());

        queue.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stop_leaves_queued_operations() {
        let client = Arc::new(MockControlPlaneClient::new());
        client.set_delay(Duration::from_millis(100));
        let queue = queue(&client);
        queue.start().unwrap();

        let first = queue.enqueue(
            OperationKind::DeleteProject,
            "Delete g1",
            metadata(json!({ "project_id": "g1" })),
        );
        let second = queue.enqueue(
            OperationKind::DeleteProject,
            "Delete g2",
            metadata(json!({ "project_id": "g2" })),
        );

        // Let the worker pick up the first one.
        for _ in 0..100 {
            if queue.status(&first).unwrap().status == OperationStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(queue.stop(Duration::from_secs(5)).await);
        assert_eq!(queue.status(&first).unwrap().status, OperationStatus::Succeeded);
        assert_eq!(queue.status(&second).unwrap().status, OperationStatus::Queued);
    }

    #[tokio::test]
    async fn stop_abandons_stuck_operation() {
        let client = Arc::new(MockControlPlaneClient::new());
        client.set_delay(Duration::from_secs(60));
        let queue = queue(&client);
        queue.start().unwrap();

        let id = queue.enqueue(
            OperationKind::DeleteProject,
            "Delete g1",
            metadata(json!({ "project_id": "g1" })),
        );
        for _ in 0..100 {
            if queue.status(&id).unwrap().status == OperationStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(!queue.stop(Duration::from_millis(50)).await);
        let record = queue.status(&id).unwrap();
        assert_eq!(record.status, OperationStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("internal error: abandoned at shutdown"));
    }

    #[tokio::test]
    async fn abandoned_operation_never_reaches_remote() {
        let client = Arc::new(MockControlPlaneClient::new());
        client.set_delay(Duration::from_millis(300));
        let queue = queue(&client);
        queue.start().unwrap();

        let id = queue.enqueue(
            OperationKind::DeleteProject,
            "Delete g1",
            metadata(json!({ "project_id": "g1" })),
        );
        for _ in 0..100 {
            if queue.status(&id).unwrap().status == OperationStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(!queue.stop(Duration::from_millis(50)).await);
        assert_eq!(queue.status(&id).unwrap().status, OperationStatus::Failed);

        // Past the point the remote call would have been made.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(client.calls().is_empty());
        assert_eq!(queue.status(&id).unwrap().status, OperationStatus::Failed);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let client: Arc<dyn ControlPlaneClient> = Arc::new(MockControlPlaneClient::new());
        let queue = Arc::new(OperationQueue::new(client, 2));
        queue.start().unwrap();

        let ids: Vec<_> = (0..4)
            .map(|i| {
                queue.enqueue(
                    OperationKind::DeleteProject,
                    format!("Delete g{i}"),
                    metadata(json!({ "project_id": format!("g{i}") })),
                )
            })
            .collect();
        wait_terminal(&queue, &ids[3]).await;

        let retained: Vec<_> = queue.list().into_iter().map(|r| r.id).collect();
        assert_eq!(retained, vec![ids[2], ids[3]]);
        assert!(queue.status(&ids[0]).is_none());

        queue.stop(Duration::from_secs(1)).await;
    }
}
