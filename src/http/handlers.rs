use super::state::AppState;
use crate::session::CallSnapshot;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallRequest {
    /// Agent to call; falls back to the configured default
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartCallResponse {
    pub status: String,
    pub call: CallSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /calls/start
pub async fn start_call(
    State(state): State<AppState>,
    Json(req): Json<StartCallRequest>,
) -> impl IntoResponse {
    let Some(agent_id) = req
        .agent_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| state.default_agent.clone())
    else {
        return error_response(StatusCode::BAD_REQUEST, "agentId is required");
    };

    // Hold the write lock so two concurrent starts cannot both succeed
    let mut current = state.current.write().await;
    if let Some(call) = current.as_ref() {
        if !call.is_finished() {
            return error_response(
                StatusCode::CONFLICT,
                format!("Call {} is still live", call.id()),
            );
        }
    }

    info!("Starting call with agent {}", agent_id);
    let call = match (state.start_call)(&agent_id) {
        Ok(call) => call,
        Err(e) => {
            error!("Failed to start call: {:#}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to start call: {:#}", e),
            );
        }
    };

    let snapshot = call.snapshot();
    *current = Some(call);

    (
        StatusCode::OK,
        Json(StartCallResponse {
            status: "starting".to_string(),
            call: snapshot,
        }),
    )
        .into_response()
}

/// POST /calls/end
/// Ends the live call and waits for its teardown
pub async fn end_call(State(state): State<AppState>) -> impl IntoResponse {
    let Some(call) = state.live_call().await else {
        return error_response(StatusCode::NOT_FOUND, "No live call");
    };

    info!("Ending call {}", call.id());
    call.end();

    match call.wait().await {
        Some(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        None => {
            error!("Call {} stopped without an outcome", call.id());
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Call {} stopped without an outcome", call.id()),
            )
        }
    }
}

/// GET /calls/status
pub async fn call_status(State(state): State<AppState>) -> impl IntoResponse {
    let current = state.current.read().await;
    match current.as_ref() {
        Some(call) => (StatusCode::OK, Json(call.snapshot())).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No call has been started"),
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
