use axum::{Json, http::StatusCode, response::IntoResponse};
use deepdive_core::DeepDiveError;
use serde::Serialize;
use std::fmt;
use tracing::error;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(error: impl ToString) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let payload = ErrorResponse {
            error: self.message,
        };
        (self.status, Json(payload)).into_response()
    }
}

impl From<DeepDiveError> for AppError {
    fn from(error: DeepDiveError) -> Self {
        match error {
            DeepDiveError::SessionNotFound(_) => Self::new(StatusCode::NOT_FOUND, error.to_string()),
            DeepDiveError::Unauthorized(_) => Self::new(StatusCode::FORBIDDEN, error.to_string()),
            DeepDiveError::InvalidInput(_) => Self::new(StatusCode::BAD_REQUEST, error.to_string()),
            other => {
                error!(error = %other, "request failed");
                Self::internal(other)
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(error)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_client_statuses() {
        let not_found = AppError::from(DeepDiveError::SessionNotFound("s1".into()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let forbidden = AppError::from(DeepDiveError::Unauthorized("s1".into()));
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let invalid = AppError::from(DeepDiveError::InvalidInput("topic".into()));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let other = AppError::from(DeepDiveError::Other(anyhow::anyhow!("boom")));
        assert_eq!(other.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
