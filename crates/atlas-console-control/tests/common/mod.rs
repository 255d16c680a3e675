//! Shared stubs for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atlas_console_control::{
    ControlError, ControlPlaneClient, DatabaseConnection, OperationQueue, OperationRecord, Result,
};
use atlas_console_core::OperationId;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

/// Connection that counts closes.
#[derive(Debug, Default)]
pub struct CountingConnection {
    closes: Arc<AtomicUsize>,
}

impl CountingConnection {
    pub fn new(closes: &Arc<AtomicUsize>) -> Self {
        Self {
            closes: Arc::clone(closes),
        }
    }
}

#[async_trait]
impl DatabaseConnection for CountingConnection {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Control-plane stub that succeeds unless a failure is registered, and
/// tracks how many calls run at once.
#[derive(Default)]
pub struct StubControlPlane {
    failures: Mutex<Vec<(&'static str, String)>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl StubControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, method: &'static str, message: &str) {
        self.failures.lock().push((method, message.to_string()));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn call(&self, method: &'static str, target: &str) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.calls.lock().push(format!("{method} {target}"));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failure = self
            .failures
            .lock()
            .iter()
            .find(|(m, _)| *m == method)
            .map(|(_, message)| message.clone());
        match failure {
            Some(message) => Err(ControlError::RemoteOperationFailed(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ControlPlaneClient for StubControlPlane {
    async fn create_project(&self, name: &str, org_id: &str) -> Result<Value> {
        self.call("create_project", name).await?;
        Ok(json!({ "id": format!("proj-{name}"), "name": name, "orgId": org_id }))
    }

    async fn delete_project(&self, project_id: &str) -> Result<Value> {
        self.call("delete_project", project_id).await?;
        Ok(json!({}))
    }

    async fn create_cluster(&self, project_id: &str, _spec: &Value) -> Result<Value> {
        self.call("create_cluster", project_id).await?;
        Ok(json!({ "stateName": "CREATING" }))
    }

    async fn delete_cluster(&self, project_id: &str, cluster_name: &str) -> Result<Value> {
        self.call("delete_cluster", &format!("{project_id}/{cluster_name}"))
            .await?;
        Ok(json!({}))
    }
}

pub fn metadata(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("metadata must be an object"),
    }
}

/// Poll until the operation reaches a terminal status.
pub async fn wait_finished(queue: &OperationQueue, id: &OperationId) -> OperationRecord {
    for _ in 0..500 {
        let record = queue.status(id).expect("operation exists");
        if record.finished_at.is_some() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("operation {id} did not finish");
}
