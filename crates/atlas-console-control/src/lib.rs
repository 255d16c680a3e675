//! Runtime core of the Atlas web console.
//!
//! This crate holds the state the console keeps between HTTP requests: live
//! database sessions keyed by opaque tokens, and a queue of long-running
//! control-plane mutations executed one at a time by a background worker.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Route layer (HTTP)                      │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                   │
//!            ▼                                   ▼
//! ┌──────────────────────┐            ┌──────────────────────┐
//! │    SessionStore      │            │   OperationQueue     │
//! │  token → connection  │            │  FIFO, one worker    │
//! └──────────────────────┘            └──────────────────────┘
//!            ▲                                   │
//!            │  reaper                           ▼
//! ┌──────────────────────┐            ┌──────────────────────┐
//! │ LifecycleCoordinator │            │  ControlPlaneClient  │
//! │  start / shutdown    │            │   (Atlas Admin API)  │
//! └──────────────────────┘            └──────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use atlas_console_control::{
//!     BoxedConnection, ConsoleConfig, LifecycleCoordinator, NoopControlPlaneClient,
//!     OperationKind, OperationQueue, SessionStore,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConsoleConfig::default();
//! let sessions: Arc<SessionStore<BoxedConnection>> =
//!     Arc::new(SessionStore::new(config.session_ttl()));
//! let operations = Arc::new(OperationQueue::new(
//!     Arc::new(NoopControlPlaneClient::new()),
//!     config.max_operation_history,
//! ));
//!
//! let coordinator = LifecycleCoordinator::new(sessions, Arc::clone(&operations), config);
//! coordinator.start()?;
//!
//! let mut metadata = serde_json::Map::new();
//! metadata.insert("name".into(), "analytics".into());
//! metadata.insert("org_id".into(), "5f1a".into());
//! let id = operations.submit(OperationKind::CreateProject, "Create analytics", metadata)?;
//! println!("queued {id}");
//!
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # State Machines
//!
//! - Operations: `Queued` → `Running` → `Succeeded` | `Failed`
//! - Sessions: `Active` → `Expired` → `Closed`, or `Active` → `Closed`
//!
//! See the [`lifecycle`] module for transition validation helpers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod login;
pub mod operation;
pub mod session;

pub use client::{ControlPlaneClient, HttpControlPlaneClient, NoopControlPlaneClient};
pub use config::ConsoleConfig;
pub use coordinator::{LifecycleCoordinator, ShutdownReport};
pub use error::{ControlError, Result};
pub use login::{login, ConnectionTarget, Connector, LoginRequest};
pub use operation::{OperationKind, OperationQueue, OperationRecord, OperationStatus};
pub use session::{
    ActiveSession, BoxedConnection, DatabaseConnection, SessionInfo, SessionState, SessionStore,
};

pub use atlas_console_core::{OperationId, SessionToken};
