use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    /// The accept lost against another driver's accepted offer.
    #[error("order {0} already taken")]
    AssignmentConflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("search exhausted: {0}")]
    Exhausted(String),

    #[error("dependency failure: {0}")]
    DependencyFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::StateConflict(_) => "state_conflict",
            AppError::AssignmentConflict(_) => "order_already_taken",
            AppError::Forbidden(_) => "forbidden",
            AppError::Exhausted(_) => "exhausted",
            AppError::DependencyFailure(_) => "dependency_failure",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::StateConflict(_) | AppError::AssignmentConflict(_) => StatusCode::CONFLICT,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Exhausted(_) => StatusCode::GONE,
            AppError::DependencyFailure(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}
