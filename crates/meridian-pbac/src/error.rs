//! Error types for the PBAC crate.

use std::path::PathBuf;

use meridian_router::RouterError;
use thiserror::Error;

/// Result type for PBAC operations.
pub type PbacResult<T> = Result<T, PbacError>;

/// Errors raised while loading or changing policies.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PbacError {
    /// A condition name has no registered factory.
    #[error("unknown condition '{0}'")]
    UnknownCondition(String),

    /// A condition's JSON value is malformed.
    #[error("invalid '{name}' condition: {message}")]
    InvalidCondition {
        /// Condition name.
        name: String,
        /// What was wrong.
        message: String,
    },

    /// An action or resource pattern is malformed.
    #[error("invalid pattern in policy '{policy}': {source}")]
    Pattern {
        /// Policy name.
        policy: String,
        /// Underlying error.
        #[source]
        source: RouterError,
    },

    /// A policy name is empty.
    #[error("policy name must not be empty")]
    EmptyName,

    /// No policy with this name.
    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    /// No member with this name.
    #[error("member not found: {0}")]
    MemberNotFound(String),

    /// A policy file could not be read.
    #[error("failed to read policy file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PbacError {
    /// Creates an invalid condition error.
    pub fn invalid_condition(name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::InvalidCondition {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Returns true if the error comes from a malformed document rather than
    /// a missing name.
    #[must_use]
    pub fn is_invalid_document(&self) -> bool {
        !matches!(self, Self::PolicyNotFound(_) | Self::MemberNotFound(_) | Self::Io { .. })
    }
}
