//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON body with an
//! appropriate status code.
//!
//! Store errors are logged with full detail; the caller only sees a generic
//! message.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use murmur_core::CoreError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the orchestrator.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The request body or query could not be interpreted.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A resource other than a task record is missing.
    #[error("not found: {0}")]
    NotFound(String),
}

impl ServerError {
    fn status_and_message(&self) -> (StatusCode, &'static str, String) {
        match self {
            ServerError::Core(e) => core_status(e),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m.clone()),
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.clone()),
        }
    }
}

/// Status code, machine-readable code and client message for an
/// orchestrator error. Also used for per-item batch results.
pub fn core_status(e: &CoreError) -> (StatusCode, &'static str, String) {
    match e {
        CoreError::Validation(m) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error", m.clone()),
        CoreError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found", e.to_string()),
        CoreError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state", e.to_string()),
        CoreError::QueueFull { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "queue_full", e.to_string())
        }
        CoreError::Shutdown => (
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting_down",
            e.to_string(),
        ),
        CoreError::Store(_) => {
            error!(error = %e, "orchestrator error");
            internal()
        }
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "internal server error".to_owned(),
    )
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.status_and_message();
        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use murmur_core::{TaskId, TaskStatus};

    use super::*;

    fn status_of(err: ServerError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn core_errors_map_to_status_codes() {
        assert_eq!(
            status_of(CoreError::Validation("empty".into()).into()),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(
                CoreError::NotFound {
                    task_id: TaskId::from("x")
                }
                .into()
            ),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(
                CoreError::InvalidState {
                    task_id: TaskId::from("x"),
                    status: TaskStatus::Processing,
                    operation: "cancel",
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(CoreError::QueueFull { capacity: 1 }.into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(ServerError::BadRequest("nope".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ServerError::NotFound("audio file not found".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn store_errors_hide_detail() {
        let err = ServerError::from(CoreError::Store("disk I/O error at /var/db".into()));
        let (status, _, message) = err.status_and_message();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!message.contains("/var/db"));
    }
}
