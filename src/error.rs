//! Error types for Solofed
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Variants follow the federation error taxonomy: lookups that miss,
/// untrusted input that fails validation, store failures, outbound
/// delivery failures and cryptographic failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// Unknown actor or resource (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Malformed or unverifiable input (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Key-value store failure (500)
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// SQLite backend error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Outbound delivery or peer fetch failed (502)
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Signature verification failed (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// Key generation, encoding or signing failed (500)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Persistence(format!("Invalid stored value: {}", err))
    }
}

impl AppError {
    /// Label used for the `errors_total` metric
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::Validation(_) => "validation",
            AppError::Persistence(_) => "persistence",
            AppError::Database(_) => "database",
            AppError::HttpClient(_) => "http_client",
            AppError::Delivery(_) => "delivery",
            AppError::InvalidSignature => "invalid_signature",
            AppError::Crypto(_) => "crypto",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Unauthorized | AppError::InvalidSignature => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Delivery(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Persistence(_) | AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Persistence error".to_string(),
            ),
            AppError::Crypto(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Crypto error".to_string(),
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let response = AppError::NotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn invalid_signature_maps_to_401() {
        let response = AppError::InvalidSignature.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn persistence_failure_hides_details() {
        let response = AppError::Persistence("disk full at /var/lib".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn delivery_failure_maps_to_bad_gateway() {
        let response = AppError::Delivery("peer down".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
