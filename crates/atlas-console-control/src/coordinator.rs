//! Startup and shutdown of the background tasks.
//!
//! The coordinator owns the two long-lived tasks of the console: the
//! operation worker and the session reaper. Route handlers talk to the
//! [`SessionStore`] and [`OperationQueue`] directly; the coordinator only
//! decides when those tasks run.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ConsoleConfig;
use crate::error::Result;
use crate::operation::OperationQueue;
use crate::session::{DatabaseConnection, SessionStore};

/// Outcome of [`LifecycleCoordinator::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Whether the worker exited within the grace period.
    pub worker_drained: bool,
    /// Number of sessions closed.
    pub sessions_closed: usize,
}

/// Starts and stops the operation worker and the session reaper.
pub struct LifecycleCoordinator<C: DatabaseConnection> {
    sessions: Arc<SessionStore<C>>,
    operations: Arc<OperationQueue>,
    config: ConsoleConfig,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl<C: DatabaseConnection> LifecycleCoordinator<C> {
    /// Create a coordinator for the given store and queue.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionStore<C>>,
        operations: Arc<OperationQueue>,
        config: ConsoleConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            sessions,
            operations,
            config,
            reaper: Mutex::new(None),
            shutdown,
        }
    }

    /// The session store.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore<C>> {
        &self.sessions
    }

    /// The operation queue.
    #[must_use]
    pub fn operations(&self) -> &Arc<OperationQueue> {
        &self.operations
    }

    /// Start the operation worker and the session reaper.
    ///
    /// Calling this again while both are running does nothing.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvariantViolation` after
    /// [`shutdown`](Self::shutdown).
    pub fn start(&self) -> Result<()> {
        self.operations.start()?;

        let mut reaper = self.reaper.lock();
        if reaper.is_none() {
            let sessions = Arc::clone(&self.sessions);
            let interval = self.config.reaper_interval();
            let shutdown = self.shutdown.subscribe();
            *reaper = Some(tokio::spawn(run_reaper(sessions, interval, shutdown)));
            tracing::info!(
                interval_secs = interval.as_secs(),
                "Started session reaper"
            );
        }
        Ok(())
    }

    /// Stop the worker and the reaper, then close every session.
    ///
    /// Operations still queued are left queued. The worker and the reaper get
    /// the shutdown grace period between them; closing sessions gets whatever
    /// grace remains, but never less than one close timeout.
    pub async fn shutdown(&self) -> ShutdownReport {
        tracing::info!("Shutting down console core");
        let deadline = Instant::now() + self.config.shutdown_grace();
        let close_timeout = self.config.close_timeout();

        self.shutdown.send_replace(true);
        let worker_drained = self.operations.stop(self.config.shutdown_grace()).await;

        let reaper = self.reaper.lock().take();
        if let Some(mut handle) = reaper {
            let limit = remaining(deadline).max(close_timeout);
            match tokio::time::timeout(limit, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Session reaper ended abnormally"),
                Err(_) => {
                    handle.abort();
                    tracing::warn!("Session reaper did not stop in time, aborted");
                }
            }
        }

        let held = self.sessions.len();
        let limit = remaining(deadline).max(close_timeout);
        let sessions_closed = match tokio::time::timeout(limit, self.sessions.close_all()).await {
            Ok(closed) => closed,
            Err(_) => {
                tracing::warn!(held, "Closing sessions did not finish in time");
                held
            }
        };

        let report = ShutdownReport {
            worker_drained,
            sessions_closed,
        };
        tracing::info!(
            worker_drained = report.worker_drained,
            sessions_closed = report.sessions_closed,
            pending_operations = self.operations.pending(),
            "Console core shut down"
        );
        report
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

async fn run_reaper<C: DatabaseConnection>(
    sessions: Arc<SessionStore<C>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = sessions.cleanup_expired().await;
                if removed > 0 {
                    tracing::debug!(removed, remaining = sessions.len(), "Reaped expired sessions");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("Session reaper exiting");
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::client::mock::MockControlPlaneClient;
    use crate::client::ControlPlaneClient;
    use crate::error::ControlError;
    use crate::operation::{OperationKind, OperationStatus};
    use crate::session::mock::{ConnectionProbe, MockConnection};

    fn coordinator(
        client: Arc<dyn ControlPlaneClient>,
        reaper_interval_seconds: u64,
    ) -> LifecycleCoordinator<MockConnection> {
        let config = ConsoleConfig {
            reaper_interval_seconds,
            shutdown_grace_seconds: 1,
            close_timeout_seconds: 1,
            ..ConsoleConfig::default()
        };
        LifecycleCoordinator::new(
            Arc::new(SessionStore::new(config.session_ttl()).with_close_timeout(config.close_timeout())),
            Arc::new(OperationQueue::new(client, config.max_operation_history)),
            config,
        )
    }

    fn metadata(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("metadata must be an object"),
        }
    }

    #[tokio::test]
    async fn shutdown_closes_sessions() {
        let coordinator = coordinator(Arc::new(MockControlPlaneClient::new()), 300);
        coordinator.start().unwrap();
        coordinator.start().unwrap();

        let probe = ConnectionProbe::new();
        for i in 0..3 {
            coordinator.sessions().create(
                MockConnection::new(&probe),
                format!("cluster{i}"),
                "alice",
                "mongodb://db1",
            );
        }

        let report = coordinator.shutdown().await;
        assert_eq!(
            report,
            ShutdownReport {
                worker_drained: true,
                sessions_closed: 3
            }
        );
        assert_eq!(probe.closes(), 3);
        assert!(coordinator.sessions().is_empty());
    }

    #[tokio::test]
    async fn shutdown_is_bounded_when_close_hangs() {
        let coordinator = coordinator(Arc::new(MockControlPlaneClient::new()), 300);
        coordinator.start().unwrap();

        let hung = ConnectionProbe::new();
        hung.set_hang_close(true);
        coordinator
            .sessions()
            .create(MockConnection::new(&hung), "cluster0", "alice", "mongodb://db1");
        let healthy = ConnectionProbe::new();
        coordinator
            .sessions()
            .create(MockConnection::new(&healthy), "cluster1", "alice", "mongodb://db2");

        let report = tokio::time::timeout(Duration::from_secs(5), coordinator.shutdown())
            .await
            .expect("shutdown must finish despite a hung close");

        assert!(report.worker_drained);
        assert_eq!(report.sessions_closed, 2);
        assert_eq!(hung.closes(), 1);
        assert_eq!(healthy.closes(), 1);
        assert!(coordinator.sessions().is_empty());
    }

    #[tokio::test]
    async fn start_after_shutdown_fails() {
        let coordinator = coordinator(Arc::new(MockControlPlaneClient::new()), 300);
        coordinator.start().unwrap();
        coordinator.shutdown().await;

        assert!(matches!(
            coordinator.start(),
            Err(ControlError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn reaper_closes_expired_sessions() {
        let coordinator = coordinator(Arc::new(MockControlPlaneClient::new()), 1);
        coordinator.start().unwrap();

        let probe = ConnectionProbe::new();
        coordinator.sessions().create_with_ttl(
            MockConnection::new(&probe),
            "cluster0",
            "alice",
            "mongodb://db1",
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(probe.closes(), 1);
        assert!(coordinator.sessions().is_empty());

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn started_worker_runs_operations() {
        let coordinator = coordinator(Arc::new(MockControlPlaneClient::new()), 300);
        coordinator.start().unwrap();

        let id = coordinator.operations().enqueue(
            OperationKind::CreateProject,
            "Create p1",
            metadata(json!({ "name": "p1", "org_id": "o1" })),
        );

        let mut status = OperationStatus::Queued;
        for _ in 0..200 {
            status = coordinator.operations().status(&id).unwrap().status;
            if status == OperationStatus::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, OperationStatus::Succeeded);

        assert!(coordinator.shutdown().await.worker_drained);
    }
}
