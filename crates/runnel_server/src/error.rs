use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use runnel_store::ErrorCode;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

/// The wire error shape: `{code, message, details?}` with the status
/// implied by the code.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ApiError {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        ApiError::new(ErrorCode::InvalidRequest, message)
    }

    pub fn auth_required(message: impl Into<String>) -> Self {
        ApiError::new(ErrorCode::AuthRequired, message)
    }

    pub fn auth_invalid(message: impl Into<String>) -> Self {
        ApiError::new(ErrorCode::AuthInvalid, message)
    }

    /// Wraps a storage error, preserving its taxonomy code. Unexpected
    /// failures are logged with a correlation id and surfaced opaquely.
    pub fn from_store(err: runnel_store::Error) -> Self {
        let code = err.code();
        if code == ErrorCode::Internal {
            let correlation_id = Uuid::new_v4();
            error!(%correlation_id, error = %err, "internal storage error");
            ApiError {
                code,
                message: "internal error".to_string(),
                details: Some(json!({ "correlationId": correlation_id })),
            }
        } else {
            ApiError::new(code, err.to_string())
        }
    }
}

fn status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::AuthRequired | ErrorCode::AuthInvalid => StatusCode::UNAUTHORIZED,
        ErrorCode::NamespaceExists
        | ErrorCode::StreamVersionConflict
        | ErrorCode::DuplicateId => StatusCode::CONFLICT,
        ErrorCode::NamespaceNotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "code": self.code.as_str(),
            "message": self.message,
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }

        (status(self.code), Json(body)).into_response()
    }
}
