//! Health check endpoint for service monitoring.

use std::time::Instant;

use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::AppState;
use crate::store::{CredentialStore, with_timeout};

/// Health check response.
///
/// Returns service status and store connectivity.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall service status
    pub status: &'static str,

    /// Store connection status
    pub database: &'static str,

    /// Round trip of the connectivity check, in milliseconds
    pub response_time: u128,

    /// Detached tasks not yet finished
    pub pending_tasks: usize,

    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
}

/// Health check handler.
///
/// # Checks
///
/// - Store connectivity (`SELECT 1` on PostgreSQL)
///
/// # Response (200 OK)
///
/// ```json
/// {
///   "status": "healthy",
///   "database": "connected",
///   "responseTime": 2,
///   "pendingTasks": 0,
///   "timestamp": "2025-12-21T19:00:00Z"
/// }
/// ```
///
/// # Response (503 Service Unavailable)
///
/// Same shape with `"status": "unhealthy"` and `"database": "disconnected"`.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();
    let result = with_timeout("ping", state.store_timeout(), state.store.ping()).await;

    let (code, status, database) = match result {
        Ok(()) => (StatusCode::OK, "healthy", "connected"),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy", "disconnected")
        }
    };

    (
        code,
        Json(HealthResponse {
            status,
            database,
            response_time: started.elapsed().as_millis(),
            pending_tasks: state.tasks.in_flight(),
            timestamp: Utc::now(),
        }),
    )
}
