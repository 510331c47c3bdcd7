//! Route pattern parsing.
//!
//! A pattern is split on transitions between literal runs and `:name` /
//! `*name` markers. Markers may carry a validator in angle brackets and must
//! end their path segment.

use std::sync::Arc;

use crate::validator::Validator;
use crate::RouterError;

/// One parsed piece of a route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    /// Literal text matched byte for byte.
    Literal(String),
    /// `:name` — consumes up to the next `/`.
    Param {
        name: String,
        validator: Option<Arc<Validator>>,
    },
    /// `*name` — consumes the rest, or up to a `/` when the pattern continues.
    Wildcard {
        name: String,
        validator: Option<Arc<Validator>>,
    },
}

/// Parses a pattern such as `/api/:version<isnum>/files/*path`.
pub(crate) fn parse(pattern: &str) -> Result<Vec<Segment>, RouterError> {
    if !pattern.starts_with('/') {
        return Err(RouterError::invalid_pattern(pattern, "must start with '/'"));
    }

    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = pattern;

    while let Some(c) = rest.chars().next() {
        if c != ':' && c != '*' {
            literal.push(c);
            rest = &rest[c.len_utf8()..];
            continue;
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }

        let body = &rest[1..];
        let name_end = body.find(|c| c == '/' || c == '<').unwrap_or(body.len());
        let name = &body[..name_end];
        if name.is_empty() {
            return Err(RouterError::invalid_pattern(pattern, "empty parameter name"));
        }

        let mut after = &body[name_end..];
        let mut validator = None;
        if let Some(spec_and_rest) = after.strip_prefix('<') {
            let close = find_validator_end(spec_and_rest).ok_or_else(|| {
                RouterError::invalid_pattern(pattern, "unterminated validator")
            })?;
            validator = Some(Arc::new(Validator::parse(&spec_and_rest[..close])?));
            after = &spec_and_rest[close + 1..];
        }

        if !after.is_empty() && !after.starts_with('/') {
            return Err(RouterError::invalid_pattern(
                pattern,
                format!("parameter '{name}' must end its segment"),
            ));
        }

        let name = name.to_string();
        segments.push(if c == ':' {
            Segment::Param { name, validator }
        } else {
            Segment::Wildcard { name, validator }
        });
        rest = after;
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

/// Finds the `>` closing a validator: the first one followed by `/` or the end.
fn find_validator_end(s: &str) -> Option<usize> {
    s.match_indices('>')
        .map(|(i, _)| i)
        .find(|&i| s[i + 1..].is_empty() || s[i + 1..].starts_with('/'))
}
