//! HTTP Error Types
//!
//! Errors returned by the plain HTTP endpoints (upgrade refusal, admin).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::dto::ApiResponse;

/// HTTP error that can be returned from handlers
#[derive(Debug, thiserror::Error)]
#[error("{status}: {message}")]
pub struct RestError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl RestError {
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "SERVICE_UNAVAILABLE",
            message: message.into(),
        }
    }
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        let body = Json(ApiResponse::<()>::error(self.code, self.message));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RestError::service_unavailable("busy");
        assert_eq!(err.code, "SERVICE_UNAVAILABLE");
        assert_eq!(err.to_string(), "503 Service Unavailable: busy");
    }

    #[test]
    fn test_into_response_status() {
        let resp = RestError::service_unavailable("Too many WebSocket connections").into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
