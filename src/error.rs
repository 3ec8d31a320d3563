use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn no_route(model: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "no_route",
            format!("no route configured for model: {model}"),
        )
    }

    pub fn auth_required(account: &str) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "auth_required",
            format!("no usable OAuth token for account: {account}"),
        )
    }

    pub fn deduplication_timeout() -> Self {
        Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            "deduplication_timeout",
            "timed out waiting for the in-flight duplicate of this request",
        )
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    #[serde(rename = "type")]
    kind: &'static str,
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            kind: "error",
            error: ErrorBody {
                error_type: self.code,
                message: self.message,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
