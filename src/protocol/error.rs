//! Error types for the subscription protocol.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::wire::RequestId;

/// Error codes understood by clients, with their JSON-RPC and HTTP mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    BadRequest,
    InternalServerError,
    NotImplemented,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotSupported,
    Timeout,
    Conflict,
    PreconditionFailed,
    PayloadTooLarge,
    UnprocessableContent,
    TooManyRequests,
    ClientClosedRequest,
}

impl ErrorCode {
    /// Wire name, e.g. `"BAD_REQUEST"`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::MethodNotSupported => "METHOD_NOT_SUPPORTED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::PreconditionFailed => "PRECONDITION_FAILED",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::UnprocessableContent => "UNPROCESSABLE_CONTENT",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::ClientClosedRequest => "CLIENT_CLOSED_REQUEST",
        }
    }

    /// JSON-RPC 2.0 integer code.
    pub fn json_rpc_code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::BadRequest => -32600,
            ErrorCode::InternalServerError | ErrorCode::NotImplemented => -32603,
            ErrorCode::Unauthorized => -32001,
            ErrorCode::Forbidden => -32003,
            ErrorCode::NotFound => -32004,
            ErrorCode::MethodNotSupported => -32005,
            ErrorCode::Timeout => -32008,
            ErrorCode::Conflict => -32009,
            ErrorCode::PreconditionFailed => -32012,
            ErrorCode::PayloadTooLarge => -32013,
            ErrorCode::UnprocessableContent => -32022,
            ErrorCode::TooManyRequests => -32029,
            ErrorCode::ClientClosedRequest => -32099,
        }
    }

    /// HTTP status equivalent.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::ParseError | ErrorCode::BadRequest => 400,
            ErrorCode::InternalServerError => 500,
            ErrorCode::NotImplemented => 501,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::MethodNotSupported => 405,
            ErrorCode::Timeout => 408,
            ErrorCode::Conflict => 409,
            ErrorCode::PreconditionFailed => 412,
            ErrorCode::PayloadTooLarge => 413,
            ErrorCode::UnprocessableContent => 422,
            ErrorCode::TooManyRequests => 429,
            ErrorCode::ClientClosedRequest => 499,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque failure raised by a procedure, a context resolver, or the session
/// itself. The session never inspects it beyond handing it to the formatter.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach an underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalServerError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Wrap an arbitrary failure as `INTERNAL_SERVER_ERROR`, keeping it as the cause.
    pub fn from_cause(cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::internal(cause.to_string()).with_cause(cause)
    }

    /// A request frame that could not be decoded.
    pub fn parse(err: &DecodeError) -> Self {
        Self::new(ErrorCode::ParseError, err.to_string()).with_cause(err.clone())
    }

    /// A subscription call answered with a plain value.
    pub fn not_a_stream(path: &str) -> Self {
        Self::internal(format!("Subscription {path} did not return an observable"))
    }

    pub fn procedure_panicked(path: &str) -> Self {
        Self::internal(format!("Procedure {path} panicked"))
    }

    pub fn missing_id() -> Self {
        Self::bad_request("`id` is required")
    }
}

impl From<DuplicateId> for RpcError {
    fn from(err: DuplicateId) -> Self {
        RpcError::bad_request(err.to_string())
    }
}

/// Inbound frame could not be turned into call envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Bytes are not UTF-8
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    /// Bytes are not JSON
    #[error("Invalid JSON: {message}")]
    InvalidJson { message: String },

    /// Top-level value is neither an object nor an array
    #[error("Expected a message object or an array of message objects")]
    NotAMessage,

    /// Batch frame with more elements than allowed
    #[error("Batch of {size} calls exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    /// One element does not match the call envelope shape
    #[error("Invalid message at index {index}: {reason}")]
    InvalidEnvelope { index: usize, reason: String },
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::InvalidJson {
            message: e.to_string(),
        }
    }
}

/// A subscription with this id is already live on the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Duplicate id {0}")]
pub struct DuplicateId(pub RequestId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::InternalServerError).unwrap();
        assert_eq!(json, "\"INTERNAL_SERVER_ERROR\"");
        assert_eq!(ErrorCode::InternalServerError.as_str(), "INTERNAL_SERVER_ERROR");
        assert_eq!(ErrorCode::ClientClosedRequest.to_string(), "CLIENT_CLOSED_REQUEST");
    }

    #[test]
    fn test_error_code_mappings() {
        assert_eq!(ErrorCode::ParseError.json_rpc_code(), -32700);
        assert_eq!(ErrorCode::BadRequest.json_rpc_code(), -32600);
        assert_eq!(ErrorCode::InternalServerError.http_status(), 500);
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
    }

    #[test]
    fn test_duplicate_id_message() {
        let err: RpcError = DuplicateId(RequestId::Number(7)).into();
        assert_eq!(err.code, ErrorCode::BadRequest);
        assert_eq!(err.message, "Duplicate id 7");

        let err: RpcError = DuplicateId(RequestId::String("abc".into())).into();
        assert_eq!(err.message, "Duplicate id abc");
    }

    #[test]
    fn test_not_a_stream_message() {
        let err = RpcError::not_a_stream("onMessage");
        assert_eq!(err.code, ErrorCode::InternalServerError);
        assert_eq!(err.message, "Subscription onMessage did not return an observable");
    }

    #[test]
    fn test_parse_error_keeps_cause() {
        let err = RpcError::parse(&DecodeError::NotAMessage);
        assert_eq!(err.code, ErrorCode::ParseError);
        assert!(err.cause.is_some());
    }
}
