//! HTTP dispatcher error types

use crate::models::ApiErrorBody;
use chat_common::{ClientError, ErrorOrigin};
use thiserror::Error;

/// HTTP dispatcher error type
#[derive(Debug, Error)]
pub enum HttpError {
    /// Transport failure that outlasted the retry budget
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// 401: the token was rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(ApiErrorBody),

    /// 403
    #[error("Forbidden: {0}")]
    Forbidden(ApiErrorBody),

    /// 404
    #[error("Not found: {0}")]
    NotFound(ApiErrorBody),

    /// Any other non-429 4xx
    #[error("Bad request ({status}): {body}")]
    BadRequest { status: u16, body: ApiErrorBody },

    /// 5xx after the retry budget ran out
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// 429 responses kept coming after every retry
    #[error("Rate limited on {route}, retry after {retry_after:.3}s")]
    RateLimited {
        route: String,
        retry_after: f64,
        global: bool,
    },

    /// Success status with a body that did not decode
    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Route template referenced a parameter that was never supplied
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    /// Client could not be constructed from the given settings
    #[error("Invalid client configuration: {0}")]
    Config(String),
}

impl HttpError {
    /// Status code of the failing response, if there was one
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized(_) => Some(401),
            Self::Forbidden(_) => Some(403),
            Self::NotFound(_) => Some(404),
            Self::RateLimited { .. } => Some(429),
            Self::BadRequest { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|status| status.as_u16()),
            Self::Decode(_) | Self::InvalidRoute(_) | Self::Config(_) => None,
        }
    }

    /// Decoded error body for 4xx failures
    #[must_use]
    pub fn api_error(&self) -> Option<&ApiErrorBody> {
        match self {
            Self::Unauthorized(body) | Self::Forbidden(body) | Self::NotFound(body) => Some(body),
            Self::BadRequest { body, .. } => Some(body),
            _ => None,
        }
    }
}

impl From<HttpError> for ClientError {
    fn from(err: HttpError) -> Self {
        let origin = ErrorOrigin::Http;
        match err {
            HttpError::Request(err) => ClientError::Transport {
                origin,
                message: err.to_string(),
            },
            HttpError::Unauthorized(body) => ClientError::Authentication {
                origin,
                message: body.message,
            },
            HttpError::Forbidden(body) => ClientError::HttpClient {
                origin,
                status: 403,
                code: body.code,
                message: body.message,
            },
            HttpError::NotFound(body) => ClientError::HttpClient {
                origin,
                status: 404,
                code: body.code,
                message: body.message,
            },
            HttpError::BadRequest { status, body } => ClientError::HttpClient {
                origin,
                status,
                code: body.code,
                message: body.message,
            },
            HttpError::Server { status, message } => ClientError::HttpServer {
                origin,
                status,
                message,
            },
            HttpError::RateLimited {
                route, retry_after, ..
            } => ClientError::RateLimitExceeded {
                origin,
                route,
                retry_after,
            },
            HttpError::Decode(err) => ClientError::ProtocolViolation {
                origin,
                message: err.to_string(),
            },
            HttpError::InvalidRoute(message) | HttpError::Config(message) => {
                ClientError::Config { origin, message }
            }
        }
    }
}

/// Result type for dispatcher operations
pub type HttpResult<T> = Result<T, HttpError>;
