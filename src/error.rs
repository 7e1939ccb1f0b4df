/// Error taxonomy of the record service
///
/// Lookups on unknown ids surface as `NotFound`, unparseable bodies and stored
/// payloads as `Malformed`. Every variant crosses the gateway boundary as a
/// server-error response with an `{"error": message}` body, the same shape the
/// real backend answers with.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum EmulatorError {
    #[error("{0}")]
    NotFound(String),

    #[error("Malformed {0}")]
    Malformed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EmulatorError {
    pub fn run_not_found(run_id: &str) -> Self {
        Self::NotFound(format!("Run {} not found", run_id))
    }

    pub fn step_not_found(step_id: &str) -> Self {
        Self::NotFound(format!("Step {} not found", step_id))
    }

    pub fn hook_not_found() -> Self {
        Self::NotFound("Hook not found".to_string())
    }

    pub fn malformed(what: &str, err: impl std::fmt::Display) -> Self {
        Self::Malformed(format!("{}: {}", what, err))
    }
}

impl IntoResponse for EmulatorError {
    fn into_response(self) -> Response {
        tracing::debug!("Request failed: {}", self);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

pub type EmulatorResult<T> = Result<T, EmulatorError>;
