use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::engine::ReconcileEngine;
use crate::history::{HistoryStore, StoreStats};
use crate::models::DownloadRecord;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn HistoryStore>,
    pub engine: Arc<ReconcileEngine>,
    /// Serializes triggered passes within this process. Concurrent
    /// processes are already safe through commit conflicts; the gate
    /// just avoids burning fetches on a pass that is about to lose.
    run_gate: Arc<tokio::sync::Mutex<()>>,
}

/// Create the API router
pub fn create_router(store: Arc<dyn HistoryStore>, engine: Arc<ReconcileEngine>) -> Router {
    let state = AppState {
        store,
        engine,
        run_gate: Arc::new(tokio::sync::Mutex::new(())),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/reconcile", post(reconcile))
        .route("/api/reports", get(get_reports))
        .route("/api/reports/:filename/processed", post(mark_processed))
        .route("/api/stats", get(get_stats))
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Trigger one reconciliation pass and return its outcome.
/// 500 carries the outcome too when the pass saw hard failures.
async fn reconcile(State(state): State<AppState>) -> Result<Response, ApiError> {
    let _gate = state.run_gate.lock().await;
    let outcome = state.engine.run().await?;

    let status = if outcome.has_hard_failures() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)).into_response())
}

/// Recent download records, newest period first
async fn get_reports(
    State(state): State<AppState>,
    Query(params): Query<ReportQuery>,
) -> Result<Json<ReportsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(500);
    let reports = state.store.recent(limit as usize).await?;
    Ok(Json(ReportsResponse {
        count: reports.len(),
        reports,
    }))
}

/// Flag a report as converted by the downstream tabular step
async fn mark_processed(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let updated = state.store.mark_processed(&filename).await?;
    if !updated {
        return Err(ApiError::NotFound(format!("No report named {}", filename)));
    }
    Ok(Json(json!({ "filename": filename, "processed": true })))
}

/// History store statistics
async fn get_stats(State(state): State<AppState>) -> Result<Json<StoreStats>, ApiError> {
    let stats = state.store.stats().await?;
    Ok(Json(stats))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct ReportQuery {
    /// Limit number of results
    limit: Option<u32>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReportsResponse {
    count: usize,
    reports: Vec<DownloadRecord>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Storage(anyhow::Error),
    NotFound(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Storage(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Storage(err) => {
                tracing::error!("Storage error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err = anyhow::anyhow!("Test error");
        let api_err: ApiError = err.into();

        match api_err {
            ApiError::Storage(_) => (),
            _ => panic!("Expected Storage error"),
        }
    }
}
