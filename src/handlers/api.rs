use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use std::sync::Arc;

use crate::core::call::CallSummary;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub active_calls: usize,
}

/// `GET /` health check
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_calls: state.registry().len(),
    })
}

/// `GET /calls` live calls, oldest first
pub async fn list_calls(State(state): State<Arc<AppState>>) -> Json<Vec<CallSummary>> {
    Json(state.registry().list())
}

/// `GET /calls/{call_id}`
pub async fn get_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> AppResult<Json<CallSummary>> {
    state
        .registry()
        .get(&call_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("call {call_id}")))
}
