//! Router error types.

use thiserror::Error;

/// Errors raised while registering routes or match-tree patterns.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// The pattern is malformed.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A segment names a validator the router does not know.
    #[error("unknown validator '{0}'")]
    UnknownValidator(String),

    /// A validator argument could not be parsed.
    #[error("invalid validator '{validator}': {reason}")]
    InvalidValidator {
        /// The validator spec.
        validator: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The HTTP method has no route tree.
    #[error("unsupported method '{0}'")]
    UnsupportedMethod(String),
}

impl RouterError {
    pub(crate) fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RouterError::invalid_pattern("/a/:", "empty parameter name");
        assert_eq!(
            err.to_string(),
            "invalid pattern '/a/:': empty parameter name"
        );
        assert_eq!(
            RouterError::UnknownValidator("nope".into()).to_string(),
            "unknown validator 'nope'"
        );
    }
}
