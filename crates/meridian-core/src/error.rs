//! Error types for Meridian.
//!
//! [`MeridianError`] is the error handlers and middleware surface to the
//! pipeline. Every variant belongs to an [`ErrorCategory`], which fixes the
//! HTTP status and the machine-readable code rendered in the JSON envelope:
//!
//! ```json
//! {"error":{"code":"NOT_FOUND","message":"...","category":"not_found"},"request_id":"..."}
//! ```

use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using [`MeridianError`].
pub type MeridianResult<T> = Result<T, MeridianError>;

/// Categories of errors for classification and handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed request (bad framing, invalid body).
    BadRequest,
    /// Missing or invalid credentials.
    Authentication,
    /// Permission denied.
    Authorization,
    /// No route or resource.
    NotFound,
    /// Route exists under other methods.
    MethodNotAllowed,
    /// Rate limiting.
    RateLimited,
    /// A circuit breaker or dependency is unavailable.
    Unavailable,
    /// The request deadline expired.
    Timeout,
    /// Internal server errors, including recovered panics.
    Internal,
}

impl ErrorCategory {
    /// Returns the default HTTP status code for this error category.
    #[must_use]
    pub const fn default_status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Authentication => StatusCode::UNAUTHORIZED,
            Self::Authorization => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code used in the error envelope.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Authentication => "AUTHENTICATION_ERROR",
            Self::Authorization => "AUTHORIZATION_DENIED",
            Self::NotFound => "NOT_FOUND",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::RateLimited => "RATE_LIMITED",
            Self::Unavailable => "SERVICE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

/// Standard error type for Meridian.
///
/// # Example
///
/// ```
/// use meridian_core::{ErrorCategory, MeridianError};
///
/// let err = MeridianError::rate_limited("slow down", Some(3));
/// assert_eq!(err.category(), ErrorCategory::RateLimited);
/// assert_eq!(err.status_code().as_u16(), 429);
/// ```
#[derive(Error, Debug)]
pub enum MeridianError {
    /// The request could not be parsed or violated framing rules.
    #[error("Bad request: {message}")]
    BadRequest {
        /// Human-readable error message.
        message: String,
    },

    /// Authentication failed.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// `WWW-Authenticate` challenge to send with the 401.
        challenge: Option<String>,
    },

    /// Authorization denied.
    #[error("Authorization denied: {message}")]
    Authorization {
        /// Human-readable error message.
        message: String,
    },

    /// Resource not found.
    #[error("Not found: {message}")]
    NotFound {
        /// Human-readable error message.
        message: String,
    },

    /// The path matched under other methods only.
    #[error("Method not allowed: {message}")]
    MethodNotAllowed {
        /// Human-readable error message.
        message: String,
        /// Methods the path accepts.
        allowed: Vec<Method>,
    },

    /// Rate limit exceeded.
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Human-readable error message.
        message: String,
        /// Seconds until the client should retry.
        retry_after_seconds: Option<u64>,
    },

    /// A breaker is open or a dependency refused service.
    #[error("Service unavailable: {message}")]
    Unavailable {
        /// Human-readable error message.
        message: String,
    },

    /// Request timeout.
    #[error("Timeout: {message}")]
    Timeout {
        /// Human-readable error message.
        message: String,
    },

    /// Internal server error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// The underlying error (not exposed to clients).
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl MeridianError {
    /// Creates a bad request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Creates an authentication error.
    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            challenge: None,
        }
    }

    /// Creates an authentication error carrying a `WWW-Authenticate` challenge.
    #[must_use]
    pub fn challenge(message: impl Into<String>, challenge: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            challenge: Some(challenge.into()),
        }
    }

    /// Creates an authorization error.
    #[must_use]
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a method-not-allowed error.
    #[must_use]
    pub fn method_not_allowed(message: impl Into<String>, allowed: Vec<Method>) -> Self {
        Self::MethodNotAllowed {
            message: message.into(),
            allowed,
        }
    }

    /// Creates a rate limited error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after_seconds,
        }
    }

    /// Creates a service unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an internal error with a source error.
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::BadRequest { .. } => ErrorCategory::BadRequest,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::Authorization { .. } => ErrorCategory::Authorization,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::MethodNotAllowed { .. } => ErrorCategory::MethodNotAllowed,
            Self::RateLimited { .. } => ErrorCategory::RateLimited,
            Self::Unavailable { .. } => ErrorCategory::Unavailable,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        self.category().default_status_code()
    }

    /// Converts this error to a serializable error envelope.
    #[must_use]
    pub fn to_envelope(&self, request_id: Option<&str>) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorDetail {
                code: self.category().code().to_string(),
                message: self.to_string(),
                category: self.category(),
                details: self.error_details(),
            },
            request_id: request_id.map(ToString::to_string),
        }
    }

    fn error_details(&self) -> Option<serde_json::Value> {
        match self {
            Self::RateLimited {
                retry_after_seconds: Some(seconds),
                ..
            } => Some(serde_json::json!({ "retry_after_seconds": seconds })),
            Self::MethodNotAllowed { allowed, .. } if !allowed.is_empty() => {
                let allowed: Vec<&str> = allowed.iter().map(Method::as_str).collect();
                Some(serde_json::json!({ "allowed": allowed }))
            }
            _ => None,
        }
    }
}

impl From<std::io::Error> for MeridianError {
    fn from(err: std::io::Error) -> Self {
        Self::internal_with_source("I/O failure", err)
    }
}

/// Serializable error envelope for HTTP responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// The error details.
    pub error: ErrorDetail,
    /// The request ID for correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Error detail within an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Error category.
    pub category: ErrorCategory,
    /// Additional error details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
