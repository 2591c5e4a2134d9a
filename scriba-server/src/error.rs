//! HTTP error mapping. Client mistakes become 4xx without ever touching
//! job state; everything else is a 500 with the message logged.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use scriba_core::ScribaError;

pub struct ApiError(pub ScribaError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<ScribaError> for ApiError {
    fn from(e: ScribaError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ScribaError::Protocol(_) | ScribaError::Input(_) => StatusCode::BAD_REQUEST,
            ScribaError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ScribaError::InvalidTransition(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn protocol(message: impl Into<String>) -> ApiError {
    ApiError(ScribaError::Protocol(message.into()))
}

pub fn not_found(job_id: &str) -> ApiError {
    ApiError(ScribaError::JobNotFound(job_id.to_string()))
}
