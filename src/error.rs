use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Main Error Type
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    // Convenience constructors
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found", resource.into()),
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// The index handle has not been populated yet.
    pub fn index_not_ready() -> Self {
        Self::new(
            ErrorCode::ServiceUnavailable,
            "Vector index not initialized. Check startup logs and INDEX_PATH.",
        )
    }

    /// Upstream generation answered with a non-success status.
    pub fn backend_status(status: u16, body: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::BackendError,
            format!("Generation backend returned HTTP {}", status),
        )
        .with_details(serde_json::json!({
            "upstream_status": status,
            "upstream_body": body.into(),
        }))
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BackendUnavailable, message)
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExternalServiceError, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

// ============================================================================
// Error Codes
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Client errors (4xx)
    BadRequest,
    NotFound,
    ValidationError,

    // Server errors (5xx)
    Internal,
    ServiceUnavailable,
    ExternalServiceError,

    // Domain specific
    BackendError,
    BackendUnavailable,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::ValidationError => 422,
            Self::Internal => 500,
            Self::ServiceUnavailable => 503,
            Self::ExternalServiceError => 502,
            Self::BackendError => 502,
            Self::BackendUnavailable => 503,
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.http_status() >= 500
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::Internal => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            Self::BackendError => "BACKEND_ERROR",
            Self::BackendUnavailable => "BACKEND_UNAVAILABLE",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

pub type Result<T> = std::result::Result<T, AppError>;

// ============================================================================
// Error Response for HTTP
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: AppError,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: AppError) -> Self {
        Self {
            error,
            request_id: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

// ============================================================================
// Error Conversion Implementations
// ============================================================================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("IO error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::backend_unavailable(format!("Generation backend unreachable: {}", err))
        } else if let Some(status) = err.status() {
            Self::backend_status(status.as_u16(), err.to_string())
        } else {
            Self::new(ErrorCode::BackendError, format!("Backend transport error: {}", err))
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::internal(format!("Task failed: {}", err))
    }
}

// ============================================================================
// Backend-specific HTTP Response Conversion
// ============================================================================

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::Json;

        log_error(&self);

        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // The request-id middleware reads this back to stamp the body.
        let body = ErrorResponse::new(self);
        let mut response = (status, Json(body.clone())).into_response();
        response.extensions_mut().insert(body);
        response
    }
}

// ============================================================================
// Error Context Extension
// ============================================================================

pub trait ErrorContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<AppError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let mut err = e.into();
            err.message = format!("{}: {}", context.into(), err.message);
            err
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn log_error(error: &AppError) {
    if error.code.is_server_error() {
        log::error!("{}", error);
    } else {
        log::warn!("{}", error);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = AppError::not_found("Request");
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.contains("Request"));
    }

    #[test]
    fn test_backend_status_details() {
        let err = AppError::backend_status(500, "model not loaded");
        assert_eq!(err.code, ErrorCode::BackendError);
        let details = err.details.unwrap();
        assert_eq!(details["upstream_status"], 500);
        assert_eq!(details["upstream_body"], "model not loaded");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(ErrorCode::ServiceUnavailable.http_status(), 503);
        assert_eq!(ErrorCode::BackendError.http_status(), 502);
        assert_eq!(ErrorCode::BackendUnavailable.http_status(), 503);
        assert_eq!(ErrorCode::ValidationError.http_status(), 422);
    }

    #[test]
    fn test_error_classification() {
        assert!(!ErrorCode::BadRequest.is_server_error());
        assert!(ErrorCode::BackendError.is_server_error());
        assert!(AppError::index_not_ready().code.is_server_error());
    }

    #[test]
    fn test_context_prefixes_message() {
        let res: std::result::Result<(), AppError> = Err(AppError::external("timeout"));
        let err = res.context("embedding query").unwrap_err();
        assert_eq!(err.message, "embedding query: timeout");
        assert_eq!(err.code, ErrorCode::ExternalServiceError);
    }

    #[test]
    fn test_error_display() {
        let err = AppError::index_not_ready();
        let display = format!("{}", err);
        assert!(display.contains("SERVICE_UNAVAILABLE"));
        assert!(display.contains("Vector index"));
    }

    #[test]
    fn test_error_response_carries_request_id() {
        let response = axum::response::IntoResponse::into_response(AppError::index_not_ready());
        assert_eq!(response.status(), 503);

        let body = response.extensions().get::<ErrorResponse>().unwrap().clone();
        assert!(body.request_id.is_none());
        let json = serde_json::to_value(body.with_request_id("req-7".to_string())).unwrap();
        assert_eq!(json["request_id"], "req-7");
        assert_eq!(json["error"]["code"], "ServiceUnavailable");
    }

    #[test]
    fn test_json_serialization() {
        let err = AppError::backend_unavailable("down");
        let json = serde_json::to_string(&ErrorResponse::new(err)).unwrap();
        assert!(json.contains("BackendUnavailable"));
        assert!(json.contains("timestamp"));
    }
}
