use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Startup and configuration failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Environment error: {0}")]
    Environment(#[from] envconfig::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded. Please slow down your requests.";

/// Failures surfaced to HTTP callers.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("Rate limit exceeded")]
    RateLimitExceeded {
        limit: u32,
        retry_after: Option<Duration>,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_api_error(err: &ApiError) -> Self {
        match err {
            ApiError::RateLimitExceeded { .. } => {
                Self::new("rate_limit_exceeded", RATE_LIMIT_MESSAGE, 429)
            }
            ApiError::Forbidden(msg) => Self::new("forbidden", msg, 403),
            ApiError::NotFound(msg) => Self::new("not_found", msg, 404),
            ApiError::InternalServerError(msg) => Self::new("internal_error", msg, 500),
        }
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_api_error(&self);
        let mut resp = (self.status_code(), Json(body)).into_response();

        if let ApiError::RateLimitExceeded { limit, retry_after } = self {
            let headers = resp.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
            // Retry-After is whole seconds; never advertise zero.
            let secs = retry_after
                .map(|d| d.as_secs_f64().ceil() as u64)
                .unwrap_or(1)
                .max(1);
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(secs));
        }

        resp
    }
}
