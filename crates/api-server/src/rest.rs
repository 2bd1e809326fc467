//! Shared handler state, error mapping and operational endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use mailflow_core::error::MailflowError;
use mailflow_engine::MailEngine;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MailEngine>,
    pub node_id: String,
    pub start_time: Instant,
    /// Flipped by the binary once workers are running.
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(engine: Arc<MailEngine>) -> Self {
        Self {
            node_id: engine.config().node_id.clone(),
            engine,
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

/// Engine error carried to the HTTP boundary.
#[derive(Debug)]
pub struct ApiError(pub MailflowError);

impl From<MailflowError> for ApiError {
    fn from(err: MailflowError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            _ if self.0.is_validation() => StatusCode::BAD_REQUEST,
            MailflowError::NotFound(_) => StatusCode::NOT_FOUND,
            MailflowError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self.0 {
            _ if self.0.is_validation() => "invalid_request",
            MailflowError::NotFound(_) => "not_found",
            MailflowError::Conflict(_) => "conflict",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self.0, "Request failed");
            metrics::counter!("api.errors").increment(1);
            "Internal processing error".to_string()
        } else {
            warn!(error = %self.0, status = status.as_u16(), "Request rejected");
            metrics::counter!("api.validation_errors").increment(1);
            self.0.to_string()
        };
        let body = ErrorResponse {
            error: self.code().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready: 200 once the node is processing jobs.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.ready.load(Ordering::Acquire) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
