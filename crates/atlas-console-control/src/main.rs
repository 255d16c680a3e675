//! Atlas Console - session and operation runtime
//!
//! Serves health probes and read-only views of the session table and the
//! operation queue. Console pages and login routes are mounted on top of the
//! same state by the web layer.

use std::sync::Arc;

use atlas_console_control::{
    BoxedConnection, ConsoleConfig, ControlError, ControlPlaneClient, HttpControlPlaneClient,
    LifecycleCoordinator, NoopControlPlaneClient, OperationId, OperationQueue, SessionStore,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    sessions: Arc<SessionStore<BoxedConnection>>,
    operations: Arc<OperationQueue>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Adapter turning `ControlError` into an HTTP response.
struct ApiError(ControlError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "atlas-console",
    })
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.operations.is_running() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "operation worker not running")
    }
}

async fn list_operations_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.operations.list())
}

async fn operation_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: OperationId = id.parse().map_err(ControlError::from)?;
    let record = state
        .operations
        .status(&id)
        .ok_or_else(|| ControlError::NotFound(format!("operation {id}")))?;
    Ok(Json(record))
}

async fn list_sessions_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sessions.list())
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/v1/operations", get(list_operations_handler))
        .route("/v1/operations/:id", get(operation_status_handler))
        .route("/v1/sessions", get(list_sessions_handler))
        .with_state(state)
}

fn control_plane_client(
    config: &ConsoleConfig,
) -> Result<Arc<dyn ControlPlaneClient>, ControlError> {
    if config.atlas_access_token.is_some() {
        let client =
            HttpControlPlaneClient::new(&config.atlas_base_url, config.atlas_access_token.clone())?;
        tracing::info!(base_url = %client.base_url(), "Using Atlas Administration API");
        Ok(Arc::new(client))
    } else {
        tracing::warn!("ATLAS_ACCESS_TOKEN not set, operations will not reach Atlas");
        Ok(Arc::new(NoopControlPlaneClient::new()))
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Received shutdown signal");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,atlas_console=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Atlas Console");

    let config = ConsoleConfig::from_env();
    tracing::info!(
        listen_addr = %config.listen_addr,
        session_ttl_secs = config.session_ttl_seconds,
        reaper_interval_secs = config.reaper_interval_seconds,
        max_operation_history = config.max_operation_history,
        "Loaded console configuration"
    );

    let client = control_plane_client(&config)?;
    let sessions =
        Arc::new(SessionStore::new(config.session_ttl()).with_close_timeout(config.close_timeout()));
    let operations = Arc::new(OperationQueue::new(client, config.max_operation_history));

    let coordinator = LifecycleCoordinator::new(
        Arc::clone(&sessions),
        Arc::clone(&operations),
        config.clone(),
    );
    coordinator.start()?;

    let app = create_router(AppState {
        sessions,
        operations,
    });

    // Start server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let report = coordinator.shutdown().await;
    if !report.worker_drained {
        tracing::warn!("Exited with an operation still in flight");
    }

    Ok(())
}
