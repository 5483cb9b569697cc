//! Error types and HTTP error response handling.
//!
//! This module defines all application errors and how they are converted
//! into HTTP responses with appropriate status codes and JSON bodies.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::services::authenticator::AuthFailure;
use crate::services::credit_ledger::LedgerError;
use crate::store::StoreError;

/// Rate limit headers
pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Message returned for every 5xx that is not handler-declared.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// Application-wide error type.
///
/// Each variant maps to a specific HTTP status code and error message.
///
/// # Error Categories
///
/// - **Infrastructure Errors**: database and store failures, always rendered generically
/// - **Authentication Errors**: missing, malformed or unknown credentials
/// - **Metering Errors**: insufficient credits and rate limiting
/// - **Validation Errors**: invalid request data
/// - **Operation Errors**: a status and message declared by the operation itself
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Database operation failed outside the store traits (pool setup, migrations).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A store call failed or timed out.
    ///
    /// Returns HTTP 500 with a generic message.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Credentials are missing, malformed, unknown, expired or belong to a deactivated user.
    ///
    /// Returns HTTP 401 Unauthorized.
    #[error("{0}")]
    Unauthorized(String),

    /// Returns HTTP 402 Payment Required with the required and available amounts.
    #[error("Insufficient credits")]
    InsufficientCredits { required: i64, available: i64 },

    /// Returns HTTP 429 Too Many Requests with `Retry-After`.
    #[error("Rate limit exceeded")]
    RateLimited { limit: u32, retry_after_secs: u64 },

    /// The caller already holds the maximum number of API keys.
    ///
    /// Returns HTTP 429.
    #[error("Maximum API keys limit reached ({0} keys)")]
    ApiKeyLimitReached(usize),

    /// Request body or parameters are invalid.
    ///
    /// Returns HTTP 400 Bad Request.
    #[error("{0}")]
    InvalidRequest(String),

    /// Request is invalid for several reasons at once, listed in `details`.
    ///
    /// Returns HTTP 400 Bad Request.
    #[error("{message}")]
    Validation {
        message: String,
        details: Vec<String>,
    },

    /// Returns HTTP 404 Not Found.
    #[error("{0}")]
    NotFound(String),

    /// Returns HTTP 409 Conflict.
    #[error("{0}")]
    Conflict(String),

    /// Failure declared by an operation.
    ///
    /// When `public` is false the message is only logged, and a 5xx is rendered with the
    /// generic message.
    #[error("{message}")]
    Operation {
        status: StatusCode,
        message: String,
        public: bool,
    },

    /// Unexpected failure. The message is logged, never sent outside development.
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Store(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::RateLimited { .. } | AppError::ApiKeyLimitReached(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AppError::InvalidRequest(_) | AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Operation { status, .. } => *status,
        }
    }

    /// Whether the error text may be shown to the caller.
    fn is_public(&self) -> bool {
        match self {
            AppError::Database(_) | AppError::Store(_) | AppError::Internal(_) => false,
            AppError::Operation { status, public, .. } => *public || !status.is_server_error(),
            _ => true,
        }
    }

    /// Build the response body `{ "error": string, ...context }`.
    ///
    /// With `expose_details` (development only) non-public errors carry their internal
    /// text under `details`.
    pub fn render(self, expose_details: bool) -> Response {
        let status = self.status();

        if !self.is_public() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        }

        let mut body = match &self {
            AppError::InsufficientCredits {
                required,
                available,
            } => json!({
                "error": self.to_string(),
                "required": required,
                "available": available,
            }),
            AppError::RateLimited {
                retry_after_secs, ..
            } => json!({
                "error": self.to_string(),
                "retryAfter": retry_after_secs,
            }),
            AppError::Validation { message, details } => json!({
                "error": message,
                "details": details,
            }),
            _ if self.is_public() => json!({ "error": self.to_string() }),
            _ => json!({ "error": INTERNAL_ERROR_MESSAGE }),
        };

        if expose_details && !self.is_public() {
            body["details"] = json!(self.to_string());
        }

        let mut response = (status, Json(body)).into_response();

        if let AppError::RateLimited {
            limit,
            retry_after_secs,
        } = self
        {
            let headers = response.headers_mut();
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
            headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(0u32));
        }

        response
    }
}

impl From<AuthFailure> for AppError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::Store(e) => AppError::Store(e),
            other => AppError::Unauthorized(other.to_string()),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidAmount(_) => {
                AppError::InvalidRequest("Amount must be a positive integer".to_string())
            }
            LedgerError::UnknownUser(_) => AppError::NotFound("User not found".to_string()),
            LedgerError::Store(e) => AppError::Store(e),
        }
    }
}

/// A body that fails to parse is a 400 in the usual `{ "error" }` shape.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match &rejection {
            JsonRejection::JsonSyntaxError(_) => "Request body is not valid JSON".to_string(),
            JsonRejection::MissingJsonContentType(_) => {
                "Expected request with `Content-Type: application/json`".to_string()
            }
            _ => rejection.body_text(),
        };
        AppError::InvalidRequest(message)
    }
}

/// Convert AppError into an HTTP response.
///
/// This implementation allows Axum handlers to return `Result<T, AppError>`
/// and have errors automatically converted to proper HTTP responses.
/// Internal details are never included here; see [`AppError::render`].
///
/// # Status Code Mapping
///
/// - `Unauthorized` → 401
/// - `InsufficientCredits` → 402 with `required` and `available`
/// - `RateLimited` → 429 with `retryAfter` and `Retry-After`
/// - `ApiKeyLimitReached` → 429
/// - `InvalidRequest` / `Validation` → 400
/// - `NotFound` → 404
/// - `Conflict` → 409
/// - `Operation` → the declared status
/// - `Database` / `Store` / `Internal` → 500 (hides details from client)
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.render(false)
    }
}
